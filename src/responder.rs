//! Remote responder: one frame in, one result out, one client at a time.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::frame::Frame;
use crate::inference::{infer_frame, InferenceGateway};
use crate::log;
use crate::logging::Logger;
use crate::protocol::{self, MessageStream, Request, Response};
use crate::render::DisplayTransform;
use crate::throughput::ThroughputCounter;

/// Pause after a failed accept.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Responder<G: InferenceGateway> {
    gateway: G,
    transform: DisplayTransform,
    logger: Logger,
    counter: ThroughputCounter,
    fps_log_interval: Duration,
    last_fps_log: Instant,
    seq: u64,
}

impl<G: InferenceGateway> Responder<G> {
    pub fn new(gateway: G, transform: DisplayTransform, latency_threshold: Duration, logger: Logger) -> Self {
        Self {
            gateway,
            transform,
            logger,
            counter: ThroughputCounter::new(latency_threshold),
            fps_log_interval: Duration::from_secs(1),
            last_fps_log: Instant::now(),
            seq: 0,
        }
    }

    pub fn with_fps_log_interval(mut self, interval: Duration) -> Self {
        self.fps_log_interval = interval;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn counter(&self) -> &ThroughputCounter {
        &self.counter
    }

    /// Answer one raw request. `None` means nothing is sent back.
    pub fn respond(&mut self, bytes: &[u8]) -> Option<Response> {
        let request = match protocol::decode_message::<Request>(bytes) {
            Ok(r) => r,
            Err(e) => {
                log!(self.logger, "[remote] {:#}", e);
                return Some(Response::Failed);
            }
        };
        let (width, height, image) = match request {
            Request::NoFrame => return None,
            Request::Frame { width, height, image } => (width, height, image),
        };

        let frame = match Frame::decode(&image, self.seq) {
            Ok(f) => f,
            Err(e) => {
                log!(self.logger, "[remote] undecodable frame: {:#}", e);
                return Some(Response::Failed);
            }
        };
        self.seq += 1;
        if frame.resolution() != (width, height) {
            log!(
                self.logger,
                "[remote] frame declared {}x{}, decoded {}x{}",
                width,
                height,
                frame.width(),
                frame.height()
            );
            return Some(Response::Failed);
        }

        self.counter.start();
        let output = infer_frame(&mut self.gateway, &frame);
        self.counter.count();
        self.log_fps();

        match output {
            Ok(out) => match out.successful() {
                Some(detections) => Some(Response::Vertices {
                    vertices: self.transform.apply(detections.vertices(0)),
                }),
                None => Some(Response::Failed),
            },
            Err(e) => {
                log!(self.logger, "[remote] inference failed: {:#}", e);
                Some(Response::Failed)
            }
        }
    }

    fn log_fps(&mut self) {
        if self.last_fps_log.elapsed() < self.fps_log_interval {
            return;
        }
        match self.counter.fps() {
            Some(report) => log!(self.logger, "[fps] {}", report),
            None => log!(self.logger, "[fps] no data"),
        }
        self.last_fps_log = Instant::now();
    }

    /// Serve one client until it disconnects. Requires a multi-thread runtime.
    pub async fn handle_connection(&mut self, stream: &mut MessageStream) -> Result<u64> {
        let mut answered = 0u64;
        while let Some(bytes) = protocol::recv_frame(stream).await? {
            let response = tokio::task::block_in_place(|| self.respond(&bytes));
            if let Some(response) = response {
                protocol::send_message(stream, &response).await?;
                answered += 1;
            }
        }
        Ok(answered)
    }

    /// Accept clients one after another, forever.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        log!(self.logger, "[remote] listening on {}", listener.local_addr()?);
        loop {
            self.serve_one(&listener).await?;
        }
    }

    /// Accept and serve a single client. Accept and transport errors end only that attempt.
    pub async fn serve_one(&mut self, listener: &TcpListener) -> Result<()> {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log!(self.logger, "[remote] accept failed: {}", e);
                // fd 枯渇などで即座に失敗し続けるのを防ぐ
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                return Ok(());
            }
        };
        log!(self.logger, "[remote] client connected: {}", peer);
        if let Err(e) = socket.set_nodelay(true) {
            log!(self.logger, "[remote] client {}: set_nodelay failed: {}", peer, e);
        }
        let mut stream = protocol::message_stream(socket);
        match self.handle_connection(&mut stream).await {
            Ok(n) => log!(self.logger, "[remote] client {} closed after {} responses", peer, n),
            Err(e) => log!(self.logger, "[remote] client {} dropped: {:#}", peer, e),
        }
        self.counter.reset();
        Ok(())
    }
}

/// Caller side of the protocol.
pub struct RemoteClient {
    stream: MessageStream,
}

impl RemoteClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let socket = TcpStream::connect(addr).await.context("failed to connect to responder")?;
        socket.set_nodelay(true)?;
        Ok(Self { stream: protocol::message_stream(socket) })
    }

    /// Send an encoded image and wait for the answer.
    pub async fn send_frame(&mut self, width: u32, height: u32, image: Vec<u8>) -> Result<Response> {
        protocol::send_message(&mut self.stream, &Request::Frame { width, height, image }).await?;
        self.recv().await
    }

    /// No frame this tick. The responder does not answer.
    pub async fn send_no_frame(&mut self) -> Result<()> {
        protocol::send_message(&mut self.stream, &Request::NoFrame).await
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> Result<()> {
        use futures::SinkExt;
        self.stream.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Response> {
        protocol::recv_message(&mut self.stream).await
    }
}
