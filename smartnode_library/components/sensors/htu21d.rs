//! HTU21D temperature and humidity sensor
//!
//! ```json
//! "htu": {
//!     "package": "sensors.htu21d",
//!     "component": "HTU21D",
//!     "constructor_args": {"i2c": "i2c", "precision_temp": 2, "precision_humid": 1},
//!     "call_function_regularly": "temp_humid",
//!     "call_interval": 600
//! }
//! ```
//!
//! Values go to `<mqtt_topic>/temperature` and `<mqtt_topic>/humidity`, where
//! `mqtt_topic` defaults to the device topic named after the component.

use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use smartnode_core::communication::{Message, SessionHandle};
use smartnode_core::core::{unknown_function, CallFuture, Capability, Component, Reading, Sensor};
use smartnode_core::error::{NodeError, NodeResult};
use smartnode_core::loader::{ComponentFactory, ResolvedArgs};
use tokio::time;

use super::{format_value, publish_arg, round_to};
use crate::components::machine::I2cBus;

pub const VERSION: &str = "3.0.2";
pub const DEFAULT_ADDRESS: u16 = 0x40;

/// Trigger temperature measurement, hold master
pub const TRIGGER_TEMPERATURE: u8 = 0xE3;
/// Trigger humidity measurement, hold master
pub const TRIGGER_HUMIDITY: u8 = 0xE5;

const CONVERSION_TIME: Duration = Duration::from_millis(50);
const STATUS_BITS: u16 = 0x0003;

/// CRC-8 over a measurement, polynomial x^8 + x^5 + x^4 + 1
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Check the checksum and strip the status bits
pub fn decode_reply(reply: &[u8]) -> NodeResult<u16> {
    let [msb, lsb, checksum] = reply else {
        return Err(NodeError::driver(format!(
            "HTU21D reply has {} bytes, expected 3",
            reply.len()
        )));
    };
    let expected = crc8(&[*msb, *lsb]);
    if expected != *checksum {
        return Err(NodeError::driver(format!(
            "HTU21D checksum mismatch: got 0x{:02x}, expected 0x{:02x}",
            checksum, expected
        )));
    }
    Ok(u16::from_be_bytes([*msb, *lsb]) & !STATUS_BITS)
}

/// The three bytes the sensor sends for `raw`
pub fn encode_reply(raw: u16) -> [u8; 3] {
    let [msb, lsb] = raw.to_be_bytes();
    [msb, lsb, crc8(&[msb, lsb])]
}

pub fn temperature_from_raw(raw: u16) -> f64 {
    -46.85 + 175.72 * f64::from(raw) / 65536.0
}

pub fn humidity_from_raw(raw: u16) -> f64 {
    -6.0 + 125.0 * f64::from(raw) / 65536.0
}

pub struct Htu21d {
    bus: Rc<I2cBus>,
    address: u16,
    precision_temp: usize,
    precision_humid: usize,
    offset_temp: f64,
    offset_humid: f64,
    topic: String,
    session: SessionHandle,
}

impl Htu21d {
    pub fn new(bus: Rc<I2cBus>, topic: impl Into<String>, session: SessionHandle) -> Self {
        Self {
            bus,
            address: DEFAULT_ADDRESS,
            precision_temp: 2,
            precision_humid: 1,
            offset_temp: 0.0,
            offset_humid: 0.0,
            topic: topic.into(),
            session,
        }
    }

    pub fn with_address(mut self, address: u16) -> Self {
        self.address = address;
        self
    }

    pub fn with_precision(mut self, temperature: usize, humidity: usize) -> Self {
        self.precision_temp = temperature;
        self.precision_humid = humidity;
        self
    }

    pub fn with_offsets(mut self, temperature: f64, humidity: f64) -> Self {
        self.offset_temp = temperature;
        self.offset_humid = humidity;
        self
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    async fn measure(&self, command: u8) -> NodeResult<u16> {
        self.bus.write(self.address, &[command])?;
        time::sleep(CONVERSION_TIME).await;
        let reply = self.bus.read(self.address, 3)?;
        decode_reply(&reply)
    }

    fn publish(&self, quantity: &str, value: f64, precision: usize) {
        self.session.publish(Message::new(
            format!("{}/{}", self.topic, quantity),
            format_value(value, precision),
        ));
    }

    /// Degrees Celsius
    pub async fn temperature(self: Rc<Self>, publish: bool) -> NodeResult<f64> {
        let raw = self.measure(TRIGGER_TEMPERATURE).await?;
        let value = round_to(temperature_from_raw(raw) + self.offset_temp, self.precision_temp);
        if publish {
            self.publish("temperature", value, self.precision_temp);
        }
        Ok(value)
    }

    /// Relative humidity in percent
    pub async fn humidity(self: Rc<Self>, publish: bool) -> NodeResult<f64> {
        let raw = self.measure(TRIGGER_HUMIDITY).await?;
        let value = round_to(humidity_from_raw(raw) + self.offset_humid, self.precision_humid);
        if publish {
            self.publish("humidity", value, self.precision_humid);
        }
        Ok(value)
    }

    pub async fn temp_humid(self: Rc<Self>, publish: bool) -> NodeResult<Reading> {
        let temperature = self.clone().temperature(publish).await?;
        let humidity = self.humidity(publish).await?;
        Ok(Reading::single("temperature", temperature, "°C").with("humidity", humidity, "%"))
    }

    pub fn factory() -> ComponentFactory {
        ComponentFactory::new("sensors.htu21d", "HTU21D", VERSION, |ctx| {
            let bus = ctx.args.component::<I2cBus>(0, "i2c")?;
            let address = ctx.args.u64_or(1, "address", u64::from(DEFAULT_ADDRESS))?;
            let address = u16::try_from(address)
                .map_err(|_| NodeError::invalid_input(format!("I2C address {} out of range", address)))?;
            let precision_temp = ctx.args.u64_or(2, "precision_temp", 2)? as usize;
            let precision_humid = ctx.args.u64_or(3, "precision_humid", 1)? as usize;
            let offset_temp = ctx.args.f64_or(4, "offset_temp", 0.0)?;
            let offset_humid = ctx.args.f64_or(5, "offset_humid", 0.0)?;
            let topic = ctx
                .args
                .string_or(6, "mqtt_topic", &ctx.node.topics().device(ctx.name))?;

            let sensor = Htu21d::new(bus, topic, ctx.node.session().clone())
                .with_address(address)
                .with_precision(precision_temp, precision_humid)
                .with_offsets(offset_temp, offset_humid);
            Ok(Rc::new(sensor))
        })
        .with_capabilities(&[Capability::Sensor, Capability::Publisher])
    }
}

impl Component for Htu21d {
    fn functions(&self) -> &'static [&'static str] {
        &["temperature", "humidity", "temp_humid"]
    }

    fn call(self: Rc<Self>, function: &str, args: ResolvedArgs) -> CallFuture {
        match function {
            "temperature" => async move { self.temperature(publish_arg(&args)?).await.map(drop) }.boxed_local(),
            "humidity" => async move { self.humidity(publish_arg(&args)?).await.map(drop) }.boxed_local(),
            "temp_humid" => async move { self.temp_humid(publish_arg(&args)?).await.map(drop) }.boxed_local(),
            other => unknown_function(other),
        }
    }

    fn as_sensor(self: Rc<Self>) -> Option<Rc<dyn Sensor>> {
        Some(self)
    }
}

impl Sensor for Htu21d {
    fn read(self: Rc<Self>, publish: bool) -> LocalBoxFuture<'static, NodeResult<Reading>> {
        self.temp_humid(publish).boxed_local()
    }
}
