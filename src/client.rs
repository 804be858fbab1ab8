//! Scripted single-connection mode: connect once, send the `--execute`
//! messages, print whatever the server sends back.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::error;

use crate::config::RunConfig;
use crate::transport::Connector;

pub async fn run(cfg: &RunConfig, execute: &[String], wait: Duration) -> Result<()> {
    let connector = Connector::new(cfg.url.clone(), cfg.headers.clone());
    let (mut sink, mut stream) = connector.connect().await?.split();

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => println!("{text}"),
                Ok(Message::Binary(data)) => println!("{}", String::from_utf8_lossy(&data)),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    error!("error while reading the message: {err}");
                    break;
                }
            }
        }
    });

    for cmd in execute {
        sink.send(Message::Text(cmd.clone()))
            .await
            .context("error while writing to the server")?;
    }

    if wait.is_zero() {
        // Stay connected until the server closes.
        let _ = reader.await;
    } else {
        tokio::select! {
            _ = sleep(wait) => {}
            _ = reader => {}
        }
    }

    Ok(())
}
