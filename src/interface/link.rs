use crate::config::{LinkConfig, SerialParity, SerialSettings};
use log::{debug, error, info};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilder, SerialPortBuilderExt, StopBits,
};

pub const CR: u8 = 13;

pub struct Message {
    pub buffer: Vec<u8>,
    pub response: oneshot::Sender<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Pause between writing a request and reading the answer.
    pub settle: Duration,
    /// Upper bound on the read once the settle time is over.
    pub read_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(20),
            read_timeout: Duration::from_millis(50),
        }
    }
}

/// Serves requests one at a time, so there is never more than one query on the wire. A request
/// that gets no bytes back within the timing budget is answered with an empty buffer.
pub async fn client<S>(
    mut stream: S,
    mut msg: mpsc::Receiver<Message>,
    timing: LinkTiming,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("Link client started");
    while let Some(message) = msg.recv().await {
        stream.write_all(&message.buffer).await?;
        stream.flush().await?;
        tokio::time::sleep(timing.settle).await;
        let mut buffer = [0; 100];
        let reply = match timeout(timing.read_timeout, stream.read(&mut buffer)).await {
            Ok(Ok(n)) => buffer[..n].to_vec(),
            Ok(Err(e)) => {
                error!("Failed to read from link: {e}");
                Vec::new()
            }
            Err(_) => {
                debug!("No bytes within {:?}", timing.read_timeout);
                Vec::new()
            }
        };
        if message.response.send(reply).is_err() {
            error!("Failed to send via channel");
        }
    }
    info!("Link client stopped");
    Ok(())
}

fn serial_builder(settings: &SerialSettings) -> io::Result<SerialPortBuilder> {
    let data_bits = match settings.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported data bits: {other}"),
            ))
        }
    };
    let stop_bits = match settings.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported stop bits: {other}"),
            ))
        }
    };
    let parity = match settings.parity {
        SerialParity::None => Parity::None,
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
    };
    Ok(
        tokio_serial::new(settings.device.to_string_lossy(), settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None),
    )
}

/// Opens the configured link and hands it to a [`client`] task.
pub async fn spawn_client(
    link: &LinkConfig,
    rx: mpsc::Receiver<Message>,
    timing: LinkTiming,
) -> io::Result<JoinHandle<io::Result<()>>> {
    match link {
        LinkConfig::Tcp { address } => {
            let stream = TcpStream::connect(address.as_str()).await?;
            let peer_addr = stream.peer_addr()?;
            info!("Link connected with peer address: {peer_addr}");
            Ok(tokio::spawn(client(stream, rx, timing)))
        }
        LinkConfig::Serial(settings) => {
            let port = serial_builder(settings)?.open_native_async()?;
            info!(
                "Link opened on {} at {} baud",
                settings.device.display(),
                settings.baud_rate
            );
            Ok(tokio::spawn(client(port, rx, timing)))
        }
    }
}

#[tokio::test]
async fn client_answers_in_request_order() {
    let (near, mut far) = tokio::io::duplex(64);
    let (tx, rx) = mpsc::channel(4);
    let link = tokio::spawn(client(near, rx, LinkTiming::default()));

    let instrument = tokio::spawn(async move {
        let mut request = [0u8; 3];
        far.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"B0\r");
        far.write_all(b"*+12.340#").await.unwrap();
        far.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"C0\r");
        // Stay silent for the second request and keep the pipe open.
        far
    });

    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(Message {
        buffer: b"B0\r".to_vec(),
        response: resp_tx,
    })
    .await
    .unwrap();
    assert_eq!(resp_rx.await.unwrap(), b"*+12.340#".to_vec());

    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(Message {
        buffer: b"C0\r".to_vec(),
        response: resp_tx,
    })
    .await
    .unwrap();
    assert!(resp_rx.await.unwrap().is_empty());

    let _far = instrument.await.unwrap();
    drop(tx);
    link.await.unwrap().unwrap();
}

#[tokio::test]
async fn tcp_client_round_trip() {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 3];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"A0\r");
        stream.write_all(b"-0.250").await.unwrap();
        stream
    });

    let (tx, rx) = mpsc::channel(4);
    let link = spawn_client(
        &LinkConfig::Tcp {
            address: addr.to_string(),
        },
        rx,
        LinkTiming::default(),
    )
    .await
    .unwrap();

    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(Message {
        buffer: b"A0\r".to_vec(),
        response: resp_tx,
    })
    .await
    .unwrap();
    assert_eq!(resp_rx.await.unwrap(), b"-0.250".to_vec());

    let _stream = server.await.unwrap();
    drop(tx);
    link.await.unwrap().unwrap();
}

#[test]
fn serial_settings_reach_the_port_builder() {
    let settings = SerialSettings {
        device: "/dev/ttyUSB3".into(),
        baud_rate: 19200,
        data_bits: 7,
        parity: SerialParity::Even,
        stop_bits: 2,
    };
    assert!(serial_builder(&settings).is_ok());

    let settings = SerialSettings {
        data_bits: 9,
        ..SerialSettings::default()
    };
    let err = serial_builder(&settings).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

#[tokio::test]
async fn missing_serial_device_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = mpsc::channel(1);
    let link = LinkConfig::Serial(SerialSettings {
        device: dir.path().join("ttyUSB9"),
        ..SerialSettings::default()
    });
    assert!(spawn_client(&link, rx, LinkTiming::default()).await.is_err());
}
