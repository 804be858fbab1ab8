//! One virtual connection: dial, receive concurrently, optionally
//! authenticate, then send load. Strictly one attempt, no retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use crate::message::MessageGetter;
use crate::metrics::Metrics;
use crate::template::MsgContext;
use crate::transport::{Connector, WsStream};

/// Everything a single simulated client needs. Cloned once per admitted
/// connection; the clones share the connector, sources and metrics.
#[derive(Clone)]
pub struct Worker {
    pub connector: Arc<Connector>,
    pub auth: Option<Arc<dyn MessageGetter>>,
    pub load: Option<Arc<dyn MessageGetter>>,
    pub wait_before_auth: Duration,
    pub wait_after_auth: Duration,
    pub message_interval: Duration,
    pub metrics: Arc<Metrics>,
}

impl Worker {
    /// Drives the connection from dial to close. The receive loop ending is
    /// the authoritative end-of-connection signal; the send side never closes
    /// the transport itself.
    pub async fn run(self) {
        let dial_start = Instant::now();
        let stream = match self.connector.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                error!("error while connecting: {err:#}");
                self.metrics.incr_dropped_connections();
                return;
            }
        };
        self.metrics.incr_active_connections();
        self.metrics.observe_connect_time(dial_start.elapsed());

        let (mut sink, stream) = stream.split();
        let receiver = spawn_receiver(stream, Arc::clone(&self.metrics));

        self.send_side(&mut sink).await;

        let _ = receiver.await;
        self.metrics.decr_active_connections();
        self.metrics.incr_dropped_connections();
    }

    async fn send_side(&self, sink: &mut SplitSink<WsStream, Message>) {
        let mut seq = 0u64;

        if let Some(auth) = &self.auth {
            if !self.wait_before_auth.is_zero() {
                sleep(self.wait_before_auth).await;
            }
            let ctx = MsgContext { seq };
            seq += 1;
            let Some(payload) = auth.get(&ctx).await else {
                error!("no auth payload produced");
                return;
            };
            if let Err(err) = sink.send(into_message(payload)).await {
                error!("error while sending the auth message: {err}");
                return;
            }
        }

        if !self.wait_after_auth.is_zero() {
            sleep(self.wait_after_auth).await;
        }

        let Some(load) = &self.load else {
            return;
        };

        if self.message_interval.is_zero() {
            self.send_load(load, sink, &mut seq).await;
            return;
        }

        let mut ticker = interval(self.message_interval);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            if !self.send_load(load, sink, &mut seq).await {
                return;
            }
        }
    }

    async fn send_load(
        &self,
        load: &Arc<dyn MessageGetter>,
        sink: &mut SplitSink<WsStream, Message>,
        seq: &mut u64,
    ) -> bool {
        let ctx = MsgContext { seq: *seq };
        *seq += 1;
        let Some(payload) = load.get(&ctx).await else {
            error!("no load payload produced");
            return false;
        };

        let send_start = Instant::now();
        if let Err(err) = sink.send(into_message(payload)).await {
            self.metrics.incr_failed_messages();
            debug!("error while sending the load message: {err}");
            return false;
        }
        self.metrics.observe_message_time(send_start.elapsed());
        self.metrics.incr_sent_messages();
        true
    }
}

fn into_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(raw) => Message::Binary(raw.into_bytes()),
    }
}

fn spawn_receiver(mut stream: SplitStream<WsStream>, metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if !text.is_empty() {
                        metrics.incr_received_messages();
                    }
                }
                Ok(Message::Binary(data)) => {
                    if !data.is_empty() {
                        metrics.incr_received_messages();
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("received close frame");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    error!("error while reading the message: {err}");
                    break;
                }
            }
        }
    })
}
