//! Spawns a handful of "replicas" and sends the same messages to all of
//! them over bounded channels, draining each at the end. Adapted from the
//! teacher's `replicas.rs` demo, swapping `tokio::sync::mpsc` and
//! `moro::async_scope!` for this crate's own `Channel` and `run`/`spawn`.

use asyncio::{run, spawn, Channel};

fn main() {
    let result = run(async {
        let replicas = 3;
        let mut senders = Vec::new();
        let mut futures = Vec::new();
        for host in 0..replicas {
            let channel: Channel<char> = Channel::new(16);
            senders.push(channel.clone());
            futures.push(spawn(replica(host, channel)));
        }

        for message in ['H', 'e', 'l', 'l', 'o', '\n'] {
            for sender in &senders {
                sender.send(message).await?;
            }
        }

        for future in futures {
            let (host, count) = future.await?;
            eprintln!("Host {host} received {count} bytes.");
        }
        Ok::<_, asyncio::Error>(())
    });
    result.unwrap();
    eprintln!("All done");
}

async fn replica(host: u32, channel: Channel<char>) -> Result<(u32, usize), asyncio::Error> {
    let mut count = 0;
    loop {
        let message = channel.receive().await?;
        eprintln!("Host {host} received message {message:?}");
        if message == '\n' {
            break;
        }
        count += 1;
    }
    Ok((host, count))
}
