//! Minimal end-to-end demo: a server that echoes application data back to
//!  its clients, and a client that sends a handful of messages and prints
//!  what comes back along with the measured round trip.
//!
//! Run with `cargo run --example echo`.

use quadlink::auth::{EchoResponder, NoAuthenticator};
use quadlink::events::{ClientEventHandler, ServerEventHandler};
use quadlink::server_info::NoServerInfo;
use quadlink::{Channel, Client, ConnectCode, QuadlinkConfig, Server};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

struct EchoRequests {
    tx: tokio::sync::mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

#[async_trait::async_trait]
impl ServerEventHandler for EchoRequests {
    async fn on_data(&self, client_id: u64, _channel: Channel, data: Vec<u8>) {
        let _ = self.tx.send((client_id, data));
    }
}

struct PrintReplies;

#[async_trait::async_trait]
impl ClientEventHandler for PrintReplies {
    async fn on_data(&self, _channel: Channel, data: Vec<u8>) {
        println!("echo: {}", String::from_utf8_lossy(&data));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).try_init().ok();

    let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel();
    let server = Arc::new(Server::new(
        Arc::new(QuadlinkConfig::new(1)),
        Arc::new(NoAuthenticator),
        Arc::new(NoServerInfo),
        Arc::new(EchoRequests { tx: echo_tx }),
    ));
    server.start("127.0.0.1:0".parse()?).await?;
    let server_addr = server.local_addr().expect("server was just started");

    let echo_server = server.clone();
    tokio::spawn(async move {
        while let Some((client_id, data)) = echo_rx.recv().await {
            if let Err(e) = echo_server
                .send_to_client(client_id, &data, Channel::RELIABLE | Channel::ORDERED)
                .await
            {
                eprintln!("echo failed: {:#}", e);
            }
        }
    });

    let result = Client::connect(
        Arc::new(QuadlinkConfig::new(1)),
        server_addr,
        Arc::new(EchoResponder),
        Arc::new(PrintReplies),
        Duration::from_secs(2),
    )
    .await?;
    anyhow::ensure!(result.code == ConnectCode::Success, "connect failed: {:?}", result.code);
    let client = result.client.expect("success implies a client handle");
    println!("connected as client {}", result.client_id);

    for i in 0..5u32 {
        let message = format!("message {}", i);
        client
            .send_to_server(message.as_bytes(), Channel::RELIABLE | Channel::ORDERED)
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("average round trip: {:?}", client.ping());

    client.disconnect().await;
    server.stop().await;
    Ok(())
}
