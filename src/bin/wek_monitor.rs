//! Stand-in for the downstream OSC consumer: prints every packet the relay
//! sends so the stream can be checked without the mapping application.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use tokio::net::UdpSocket;

use pose_relay::osc::decode_packet;
use pose_relay::pose::KeypointIndex;

#[derive(Parser, Debug)]
#[command(about = "Print OSC packets received on a UDP port")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value_t = 3333)]
    port: u16,
    /// Print every keypoint triple instead of a one-line summary
    #[arg(short, long)]
    full: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let bind = format!("{}:{}", args.host, args.port);
    let socket = UdpSocket::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    println!("Listening on {}", socket.local_addr()?);

    let mut buf = vec![0u8; 64 * 1024];
    let mut count = 0u32;
    let mut timer = Instant::now();

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let (address, values) = match decode_packet(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                eprintln!("{} bytes from {}: {}", n, from, e);
                continue;
            }
        };

        if args.full {
            println!("{} ({} args, {} bytes)", address, values.len(), n);
            for (i, triple) in values.chunks(3).enumerate() {
                let name = KeypointIndex::from_index(i).map(|k| k.part_name()).unwrap_or("?");
                println!("  {:>14} {:?}", name, triple);
            }
        } else if let [x, y, score, ..] = values.as_slice() {
            println!("{} nose=({:.3}, {:.3}) score={:.2} [{} args]", address, x, y, score, values.len());
        } else {
            println!("{} {:?}", address, values);
        }

        count += 1;
        if timer.elapsed().as_secs_f32() >= 1.0 {
            eprintln!("[fps] {}", count);
            count = 0;
            timer = Instant::now();
        }
    }
}
