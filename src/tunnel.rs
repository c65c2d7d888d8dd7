//! Tunnel endpoint contract and TUN-device implementation.
//!
//! The datapath only needs two operations per endpoint: read one layer-3
//! frame, write one layer-3 frame. The traits are exactly the width of that
//! contract, which keeps the mechanism open (a kernel TUN device in
//! production, an in-memory pair in tests). Address assignment and routing
//! for the devices are left to external tooling.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

use crate::error::{GatewayError, GatewayResult};

/// Read half of a tunnel endpoint. Each call yields exactly one frame.
#[async_trait]
pub trait TunnelReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half of a tunnel endpoint. Each call emits exactly one frame.
#[async_trait]
pub trait TunnelWriter: Send {
    async fn write(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// A named endpoint, split into its two halves for the reader and writer
/// tasks.
pub struct Endpoint {
    pub name: String,
    pub reader: Box<dyn TunnelReader>,
    pub writer: Box<dyn TunnelWriter>,
}

/// Create a TUN endpoint.
///
/// The device is brought up with the given MTU; the kernel assigns a name
/// unless `name_hint` is provided.
pub fn create_tun(name_hint: Option<&str>, mtu: u16) -> GatewayResult<Endpoint> {
    let mut tun_config = Configuration::default();
    tun_config.mtu(mtu).up();
    if let Some(name) = name_hint {
        #[allow(deprecated)]
        tun_config.name(name);
    }

    let device: AsyncDevice = tun::create_as_async(&tun_config)
        .map_err(|e| GatewayError::tunnel_with_source("Failed to create TUN device", e))?;
    let name = device
        .tun_name()
        .map_err(|e| GatewayError::tunnel_with_source("Failed to get TUN name", e))?;

    log::info!("Created TUN device {} (mtu {})", name, mtu);

    // The tun crate returns (writer, reader) order from split().
    let (writer, reader) = device
        .split()
        .map_err(|e| GatewayError::tunnel_with_source("Failed to split TUN device", e))?;

    Ok(Endpoint {
        name,
        reader: Box::new(TunReader { reader }),
        writer: Box::new(TunWriter { writer }),
    })
}

struct TunReader {
    reader: DeviceReader,
}

#[async_trait]
impl TunnelReader for TunReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

struct TunWriter {
    writer: DeviceWriter,
}

#[async_trait]
impl TunnelWriter for TunWriter {
    async fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.writer.write_all(frame).await?;
        Ok(frame.len())
    }
}
