//! Byte transport to the remote telemetry device.
//!
//! The device is reached over a Bluetooth rfcomm or USB serial port. The session splits the
//! stream once: the read half feeds the [`FrameDecoder`](crate::frame::FrameDecoder) and the
//! write half becomes the [`RemoteLink`] used for the single-byte enable/disable commands.
//!
//! Anything implementing `AsyncRead + AsyncWrite + Unpin + Send` is a [`Transport`], which
//! lets tests drive the engine through `tokio::io::duplex`.

use crate::error::{AppResult, DaqError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

/// Command byte that starts telemetry streaming on the device.
pub const ENABLE_TELEMETRY: u8 = b'n';
/// Command byte that stops telemetry streaming on the device.
pub const DISABLE_TELEMETRY: u8 = b'f';

/// Trait alias for the bidirectional device stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Type-erased transport.
pub type DynTransport = Box<dyn Transport>;

/// Read side handed to the frame decoder.
pub type TransportReader = ReadHalf<DynTransport>;

/// Split a transport into its decoder input and its command link.
pub fn split_transport(transport: DynTransport) -> (TransportReader, RemoteLink) {
    let (reader, writer) = tokio::io::split(transport);
    (reader, RemoteLink { writer })
}

/// Write side of the transport, owned exclusively by the session.
pub struct RemoteLink {
    writer: WriteHalf<DynTransport>,
}

impl RemoteLink {
    /// Ask the device to start streaming frames.
    pub async fn enable_telemetry(&mut self) -> AppResult<()> {
        self.send(ENABLE_TELEMETRY).await
    }

    /// Ask the device to stop streaming frames.
    pub async fn disable_telemetry(&mut self) -> AppResult<()> {
        self.send(DISABLE_TELEMETRY).await
    }

    async fn send(&mut self, command: u8) -> AppResult<()> {
        debug!(command = %char::from(command), "Sending remote command");
        self.writer
            .write_all(&[command])
            .await
            .map_err(DaqError::Transport)?;
        self.writer.flush().await.map_err(DaqError::Transport)
    }
}

/// Open a real serial port, 8N1 without flow control.
///
/// Opening is wrapped in `spawn_blocking` since some rfcomm bindings block for seconds
/// while the Bluetooth link comes up.
#[cfg(feature = "serial")]
pub async fn open_serial(port_path: &str, baud_rate: u32) -> AppResult<DynTransport> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let stream = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DaqError::Transport(std::io::Error::other(e)))?
    .map_err(|e| DaqError::Transport(std::io::Error::other(e)))?;

    tracing::info!(port = %port_path, baud_rate, "Serial transport opened");
    Ok(Box::new(stream))
}

/// Stub used when the binary is built without serial support.
#[cfg(not(feature = "serial"))]
pub async fn open_serial(port_path: &str, _baud_rate: u32) -> AppResult<DynTransport> {
    debug!(port = %port_path, "Serial transport requested without serial feature");
    Err(DaqError::FeatureNotEnabled("serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_remote_commands_reach_device() {
        let (host, mut device) = tokio::io::duplex(64);
        let (_reader, mut link) = split_transport(Box::new(host));

        link.enable_telemetry().await.unwrap();
        link.disable_telemetry().await.unwrap();

        let mut buf = [0u8; 2];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"nf");
    }

    #[tokio::test]
    async fn test_command_after_device_gone_is_transport_fault() {
        let (host, device) = tokio::io::duplex(64);
        let (_reader, mut link) = split_transport(Box::new(host));
        drop(device);

        let err = link.enable_telemetry().await.unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
    }

    #[cfg(not(feature = "serial"))]
    #[tokio::test]
    async fn test_open_serial_without_feature() {
        let err = open_serial("/dev/rfcomm1", 9600).await.err().unwrap();
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
    }
}
