use crate::components::send_recv::SendRecv;
use crate::config::PlantConfig;
use crate::error::Result;
use crate::interface::link::{client, spawn_client, LinkTiming, Message, CR};
use crate::TankId;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{channel, Sender};
use tokio::task::JoinHandle;

/// Channels `A` through `Z`.
pub const MAX_CHANNELS: u8 = 26;

#[derive(Debug, PartialEq)]
enum ReadingError {
    NoReading,
    Parse(String),
}

/// Instrument address for a tank: tank 1 is `A`, tank 2 is `B` and so on. Tanks the instrument
/// cannot address have no channel.
pub fn channel_address(tank: TankId, channel_count: u8) -> Option<u8> {
    let channel_count = channel_count.min(MAX_CHANNELS);
    if tank == 0 || tank > TankId::from(channel_count) {
        return None;
    }
    Some(b'A' + (tank - 1) as u8)
}

pub const fn request_frame(address: u8) -> [u8; 3] {
    [address, b'0', CR]
}

fn parse_reading(bytes: &[u8]) -> std::result::Result<f64, ReadingError> {
    let clean: String = bytes
        .iter()
        .filter(|b| b.is_ascii() && **b != b'*' && **b != b'#')
        .map(|&b| b as char)
        .collect();
    let clean = clean.trim();
    if clean.is_empty() {
        return Err(ReadingError::NoReading);
    }
    let number = clean.strip_prefix('+').unwrap_or(clean);
    match number.parse::<f64>() {
        Ok(weight) if weight.is_finite() => Ok(weight),
        _ => Err(ReadingError::Parse(clean.to_string())),
    }
}

/// Handle to the shared weighing instrument. Every tank is a channel on the same link, and the
/// link client answers one query at a time.
pub struct WeightChannel {
    sender: Option<Sender<Message>>,
    channel_count: u8,
}

impl WeightChannel {
    pub fn new(sender: Sender<Message>, channel_count: u8) -> Self {
        Self {
            sender: Some(sender),
            channel_count,
        }
    }

    pub fn with_client<S>(
        stream: S,
        timing: LinkTiming,
        channel_count: u8,
    ) -> (Self, impl Future<Output = io::Result<()>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = channel(1);
        (Self::new(tx, channel_count), client(stream, rx, timing))
    }

    /// Opens the configured link and spawns its client task.
    pub async fn connect(config: &PlantConfig) -> Result<(Self, JoinHandle<io::Result<()>>)> {
        let (tx, rx) = channel(1);
        let timing = LinkTiming {
            settle: config.settle_time(),
            read_timeout: config.read_timeout(),
        };
        let handle = spawn_client(&config.link, rx, timing).await?;
        Ok((Self::new(tx, config.channel_count), handle))
    }

    /// Current weight on the tank's channel, or `None` when there is nothing usable this time.
    pub async fn query(&self, tank: TankId) -> Option<f64> {
        let Some(address) = channel_address(tank, self.channel_count) else {
            error!(
                "Tank {tank} has no weighing channel (instrument has {})",
                self.channel_count
            );
            return None;
        };
        let reply = self.write(&request_frame(address)).await?;
        match parse_reading(&reply) {
            Ok(weight) => Some(weight),
            Err(ReadingError::NoReading) => {
                debug!("No response from load cell {}", address as char);
                None
            }
            Err(ReadingError::Parse(text)) => {
                warn!("Invalid weight format from {}: '{text}'", address as char);
                None
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_some()
    }

    /// Drops the request side of the link; the client task finishes and releases the port.
    pub fn close(&mut self) {
        if self.sender.take().is_some() {
            info!("Weight channel closed");
        }
    }
}

impl SendRecv for WeightChannel {
    fn get_sender(&self) -> Option<&Sender<Message>> {
        self.sender.as_ref()
    }
}

#[test]
fn tank_numbers_map_to_letters() {
    assert_eq!(channel_address(1, MAX_CHANNELS), Some(b'A'));
    assert_eq!(channel_address(2, MAX_CHANNELS), Some(b'B'));
    assert_eq!(channel_address(23, MAX_CHANNELS), Some(b'W'));
    assert_eq!(channel_address(26, MAX_CHANNELS), Some(b'Z'));
    assert_eq!(channel_address(27, MAX_CHANNELS), None);
    assert_eq!(channel_address(0, MAX_CHANNELS), None);
    assert_eq!(channel_address(9, 8), None);
    assert_eq!(request_frame(b'C'), *b"C0\r");
}

#[test]
fn parses_framed_readings() {
    assert_eq!(parse_reading(b"*+12.345#"), Ok(12.345));
    assert_eq!(parse_reading(b"  -0.5\r\n"), Ok(-0.5));
    assert_eq!(parse_reading(b"7"), Ok(7.0));
    assert_eq!(parse_reading(b""), Err(ReadingError::NoReading));
    assert_eq!(parse_reading(b"*#\r"), Err(ReadingError::NoReading));
    assert_eq!(
        parse_reading(b"*ERR#"),
        Err(ReadingError::Parse("ERR".into()))
    );
    assert!(matches!(parse_reading(b"nan"), Err(ReadingError::Parse(_))));
}

#[tokio::test]
async fn query_goes_through_the_link() {
    let (tx, mut rx) = channel::<Message>(1);
    let mock_client = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            seen.push(msg.buffer[0]);
            let reply = match msg.buffer[0] {
                b'A' => b"*+10.000#".to_vec(),
                b'B' => b"garbage".to_vec(),
                _ => Vec::new(),
            };
            if msg.response.send(reply).is_err() {
                eprintln!("Unable to send Response");
            }
        }
        seen
    });

    let mut channel = WeightChannel::new(tx, MAX_CHANNELS);
    assert_eq!(channel.query(1).await, Some(10.0));
    assert_eq!(channel.query(2).await, None);
    assert_eq!(channel.query(3).await, None);
    assert_eq!(channel.query(40).await, None);

    channel.close();
    assert!(!channel.is_open());
    assert_eq!(channel.query(1).await, None);
    assert_eq!(mock_client.await.unwrap(), vec![b'A', b'B', b'C']);
}
