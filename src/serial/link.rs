//! Device link: the single owner of the open serial port.
//!
//! Port I/O is blocking, so the interface lives on a blocking worker and the
//! async side talks to it through a command channel, one oneshot reply per
//! request. Every request method takes `&mut self`, which keeps exactly one
//! request in flight.
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::interface::{Connector, SerialInterface};
use super::protocol::{self, Request, Tag};
use super::{Result, SerialError};

enum LinkCommand {
    Request {
        request: Request,
        sensor_count: Option<usize>,
        responder: oneshot::Sender<Result<Vec<i32>>>,
    },
    Shutdown,
}

pub struct DeviceLink {
    cmd_tx: mpsc::Sender<LinkCommand>,
    port_name: String,
    sensor_count: Option<usize>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceLink {
    /// Open the transport through `connector` and start the worker.
    pub async fn open(connector: &dyn Connector) -> Result<Self> {
        let interface = connector.open().await?;
        Ok(Self::spawn(interface))
    }

    /// Start a worker around an already open interface
    pub fn spawn(interface: SerialInterface) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let port_name = interface.port_name().to_string();
        let worker = tokio::task::spawn_blocking(move || link_worker(interface, cmd_rx));

        Self {
            cmd_tx,
            port_name,
            sensor_count: None,
            worker: Some(worker),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Number of sensor channels, known after the first threshold response
    pub fn sensor_count(&self) -> Option<usize> {
        self.sensor_count
    }

    /// Read the live sensor values
    pub async fn get_values(&mut self) -> Result<Vec<i32>> {
        self.request(Request::Values).await
    }

    /// Read the thresholds stored on the device
    pub async fn get_thresholds(&mut self) -> Result<Vec<i32>> {
        self.request(Request::Thresholds).await
    }

    /// Set one threshold and return the device's full threshold vector
    pub async fn update_threshold(&mut self, index: usize, value: i32) -> Result<Vec<i32>> {
        self.request(Request::SetThreshold { index, value }).await
    }

    /// Set every threshold in index order, one round trip each, and return
    /// the last echo.
    pub async fn update_thresholds(&mut self, values: &[i32]) -> Result<Vec<i32>> {
        let mut echo = None;
        for (index, value) in values.iter().enumerate() {
            echo = Some(self.update_threshold(index, *value).await?);
        }
        match echo {
            Some(echo) => Ok(echo),
            None => self.get_thresholds().await,
        }
    }

    /// Stop the worker and release the port
    pub async fn close(mut self) {
        let _ = self.cmd_tx.send(LinkCommand::Shutdown).await;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::warn!("Device link worker for {} ended abnormally: {}", self.port_name, e);
            }
        }
        log::info!("Closed device link on {}", self.port_name);
    }

    async fn request(&mut self, request: Request) -> Result<Vec<i32>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Request {
                request,
                sensor_count: self.sensor_count,
                responder: tx,
            })
            .await
            .map_err(|_| SerialError::ConnectionFailed("Device link worker stopped".into()))?;

        let values = rx
            .await
            .map_err(|_| SerialError::ConnectionFailed("Device link dropped the request".into()))??;

        if self.sensor_count.is_none() && request.expected_tag() == Tag::Thresholds {
            log::info!("Device on {} reports {} sensors", self.port_name, values.len());
            self.sensor_count = Some(values.len());
        }

        Ok(values)
    }
}

fn link_worker(mut interface: SerialInterface, mut cmd_rx: mpsc::Receiver<LinkCommand>) {
    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            LinkCommand::Request { request, sensor_count, responder } => {
                let result = interface
                    .transact(&request)
                    .and_then(|line| protocol::expect_response(&line, request.expected_tag(), sensor_count));

                if let Err(ref e) = result {
                    log::debug!("Request {:?} on {} failed: {}", request, interface.port_name(), e);
                }
                let _ = responder.send(result);
            }
            LinkCommand::Shutdown => break,
        }
    }
    log::debug!("Device link worker for {} stopped", interface.port_name());
}
