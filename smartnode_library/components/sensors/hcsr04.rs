//! HC-SR04 ultrasonic distance sensor
//!
//! ```json
//! "sonar": {
//!     "package": "sensors.hcsr04",
//!     "component": "HCSR04",
//!     "constructor_args": {
//!         "pin_trigger": "D5",
//!         "pin_echo": "D6",
//!         "temp_sensor": "htu",
//!         "precision": 2,
//!         "interval": 600
//!     }
//! }
//! ```
//!
//! The sensor runs its own measurement loop. Its interval can be changed at runtime
//! by publishing seconds to `<device>/<name>/interval/set`. Readings are only
//! reliable on flat surfaces within about 80cm.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use smartnode_core::communication::{Message, QoS, RemoteLogger, SessionHandle};
use smartnode_core::core::{
    unknown_function, CallFuture, Capability, Component, NodeContext, Reading, Sensor,
};
use smartnode_core::error::{NodeError, NodeResult};
use smartnode_core::loader::{ComponentFactory, ResolvedArgs};
use smartnode_core::scheduling::SchedulerHandle;
use tokio::time::{self, Instant};

use super::{format_value, publish_arg, round_to};
use crate::drivers::SimulationEchoDriver;

pub const VERSION: &str = "0.2.0";

/// Echo timeout in microseconds, around the sensor's 4m limit
pub const DEFAULT_TIMEOUT_US: u32 = 30_000;

const SAMPLES: usize = 20;
const SAMPLE_SPACING: Duration = Duration::from_millis(10);
/// Echoes at or below this (~3cm) are under the sensor minimum
const MIN_ECHO_US: u32 = 175;
const MAX_BAD_SAMPLES: usize = 10;
/// Extremes dropped from each end before averaging
const TRIMMED: usize = 2;
const FIRST_MEASUREMENT_DELAY: Duration = Duration::from_secs(1);
const INTERVAL_RECHECK: Duration = Duration::from_secs(1);

/// Centimetres for a round-trip echo of `pulse_us`, compensated for air
/// temperature when known
pub fn distance_from_echo(pulse_us: f64, temperature: Option<f64>) -> f64 {
    match temperature {
        Some(t) => (pulse_us / 2.0) * ((331.5 + 0.6 * t) / 10_000.0),
        None => (pulse_us / 2.0) / 29.14,
    }
}

pub struct Hcsr04 {
    name: String,
    driver: RefCell<SimulationEchoDriver>,
    temp_sensor: Option<Rc<dyn Sensor>>,
    precision: usize,
    offset: f64,
    interval: Cell<Duration>,
    topic: String,
    session: SessionHandle,
    logger: RemoteLogger,
}

impl Hcsr04 {
    pub fn new(name: &str, driver: SimulationEchoDriver, node: &NodeContext) -> Self {
        let mut driver = driver;
        driver.init();
        Self {
            name: name.to_string(),
            driver: RefCell::new(driver),
            temp_sensor: None,
            precision: 2,
            offset: 0.0,
            interval: Cell::new(node.default_call_interval()),
            topic: node.topics().device(name),
            session: node.session().clone(),
            logger: node.logger(name),
        }
    }

    pub fn with_temp_sensor(mut self, sensor: Option<Rc<dyn Sensor>>) -> Self {
        self.temp_sensor = sensor;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        self.interval.set(interval);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval.get()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Access the echo driver, e.g. to move the simulated object
    pub fn driver(&self) -> std::cell::RefMut<'_, SimulationEchoDriver> {
        self.driver.borrow_mut()
    }

    /// Subscribe to `interval_topic` and start the measurement loop
    pub fn start(self: &Rc<Self>, interval_topic: &str, node: &NodeContext) -> NodeResult<()> {
        let weak = Rc::downgrade(self);
        node.session()
            .subscribe(interval_topic, QoS::AtLeastOnce, move |message: Message| {
                let weak = weak.clone();
                async move {
                    if let Some(sensor) = weak.upgrade() {
                        sensor.apply_interval(&message);
                    }
                }
            })?;
        node.scheduler().spawn(
            format!("{}.loop", self.name),
            Self::measure_loop(self.clone(), node.scheduler().clone()),
        );
        Ok(())
    }

    fn apply_interval(&self, message: &Message) {
        let payload = message.payload_str().unwrap_or_default().trim();
        let interval = payload
            .parse::<f64>()
            .ok()
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        match interval {
            Some(interval) => {
                self.interval.set(interval);
                let state_topic = message.topic.trim_end_matches("/set").to_string();
                self.session
                    .publish(Message::new(state_topic, payload.to_string()).retained(true));
            }
            _ => self
                .logger
                .error(format!("Can't convert interval {:?} to seconds", payload)),
        }
    }

    async fn measure_loop(sensor: Rc<Self>, scheduler: SchedulerHandle) -> NodeResult<()> {
        let cycle = async {
            time::sleep(FIRST_MEASUREMENT_DELAY).await;
            loop {
                let started = Instant::now();
                if let Err(e) = sensor.clone().distance(None, false, true).await {
                    log::debug!("{}: measurement failed: {}", sensor.name, e);
                }
                // a shorter interval set meanwhile takes effect within a second
                while started.elapsed() < sensor.interval.get() {
                    time::sleep(INTERVAL_RECHECK).await;
                }
            }
        };
        tokio::select! {
            _ = scheduler.shutdown_requested() => Ok(()),
            _ = cycle => Ok(()),
        }
    }

    async fn air_temperature(&self) -> Option<f64> {
        let sensor = self.temp_sensor.clone()?;
        match sensor.read(false).await {
            Ok(reading) => reading.get("temperature").or_else(|| reading.primary()),
            Err(e) => {
                self.logger.warn(format!(
                    "Couldn't read temp sensor, using fallback calculation: {}",
                    e
                ));
                None
            }
        }
    }

    /// Distance in centimetres from [`SAMPLES`] trimmed and averaged echoes.
    ///
    /// `temperature` overrides the temperature sensor. With `ignore_errors` a failed
    /// measurement is not reported on the log topic.
    pub async fn distance(
        self: Rc<Self>,
        temperature: Option<f64>,
        ignore_errors: bool,
        publish: bool,
    ) -> NodeResult<f64> {
        let temperature = match temperature {
            Some(t) => Some(t),
            None => self.air_temperature().await,
        };

        let mut samples = Vec::with_capacity(SAMPLES);
        let mut bad = 0;
        let mut warning = "minimum distance reached or different problem".to_string();
        for _ in 0..SAMPLES {
            let echo = self.driver.borrow_mut().pulse();
            match echo {
                Ok(width) if width > MIN_ECHO_US => samples.push(width),
                Ok(_) => bad += 1,
                Err(e) => {
                    warning = e.to_string();
                    bad += 1;
                }
            }
            time::sleep(SAMPLE_SPACING).await;
        }

        if bad > MAX_BAD_SAMPLES {
            let message = format!("Too many bad sensor readings, error: {}", warning);
            if !ignore_errors {
                self.logger.error(&message);
            }
            return Err(NodeError::driver(message));
        }

        samples.sort_unstable();
        let kept = &samples[TRIMMED..samples.len() - TRIMMED];
        let mean = kept.iter().map(|&w| f64::from(w)).sum::<f64>() / kept.len() as f64;

        let distance = distance_from_echo(mean, temperature);
        if distance < 0.0 {
            self.logger.warn("Sensor reading <0");
            return Err(NodeError::driver("negative distance"));
        }
        let distance = round_to(distance, self.precision) + self.offset;
        if publish {
            self.session.publish(Message::new(
                self.topic.clone(),
                format_value(distance, self.precision),
            ));
        }
        Ok(distance)
    }

    pub fn factory() -> ComponentFactory {
        ComponentFactory::new("sensors.hcsr04", "HCSR04", VERSION, |ctx| {
            let pin_trigger = ctx.args.string_or(0, "pin_trigger", "")?;
            let pin_echo = ctx.args.string_or(1, "pin_echo", "")?;
            let timeout = ctx.args.u64_or(2, "timeout", u64::from(DEFAULT_TIMEOUT_US))?;
            let timeout = u32::try_from(timeout)
                .map_err(|_| NodeError::invalid_input(format!("timeout {}us out of range", timeout)))?;
            let temp_sensor = ctx.args.optional_sensor(3, "temp_sensor")?;
            let precision = ctx.args.u64_or(4, "precision", 2)? as usize;
            let offset = ctx.args.f64_or(5, "offset", 0.0)?;
            let default_interval = ctx.node.default_call_interval().as_secs_f64();
            let interval = ctx.args.f64_or(6, "interval", default_interval)?;
            if !(interval > 0.0 && interval.is_finite()) {
                return Err(NodeError::invalid_input("interval must be positive"));
            }
            let interval = Duration::try_from_secs_f64(interval).map_err(|_| {
                NodeError::invalid_input(format!("interval {}s out of range", interval))
            })?;
            let topic = ctx
                .args
                .string_or(7, "mqtt_topic", &ctx.node.topics().device(ctx.name))?;
            let interval_topic = ctx.args.string_or(
                8,
                "mqtt_topic_interval",
                &ctx.node.topics().command(&format!("{}/interval", ctx.name)),
            )?;
            let simulated = ctx.args.f64_or(9, "simulated_distance", 100.0)?;

            log::debug!(
                "{}: trigger {:?}, echo {:?}, simulated object at {}cm",
                ctx.name,
                pin_trigger,
                pin_echo,
                simulated
            );
            let sensor = Rc::new(
                Hcsr04::new(ctx.name, SimulationEchoDriver::new(simulated, timeout), ctx.node)
                    .with_temp_sensor(temp_sensor)
                    .with_precision(precision)
                    .with_offset(offset)
                    .with_interval(interval)
                    .with_topic(topic),
            );
            sensor.start(&interval_topic, ctx.node)?;
            Ok(sensor)
        })
        .with_capabilities(&[Capability::Sensor, Capability::Publisher, Capability::Subscriber])
    }
}

impl Component for Hcsr04 {
    fn functions(&self) -> &'static [&'static str] {
        &["distance"]
    }

    fn call(self: Rc<Self>, function: &str, args: ResolvedArgs) -> CallFuture {
        match function {
            "distance" => async move {
                let publish = publish_arg(&args)?;
                let temperature = args.value(1, "temp").and_then(|v| v.as_f64());
                let ignore_errors = args.bool_or(2, "ignore_errors", false)?;
                self.distance(temperature, ignore_errors, publish).await.map(drop)
            }
            .boxed_local(),
            other => unknown_function(other),
        }
    }

    fn as_sensor(self: Rc<Self>) -> Option<Rc<dyn Sensor>> {
        Some(self)
    }
}

impl Sensor for Hcsr04 {
    fn read(self: Rc<Self>, publish: bool) -> LocalBoxFuture<'static, NodeResult<Reading>> {
        self.distance(None, false, publish)
            .map(|distance| distance.map(|d| Reading::single("distance", d, "cm")))
            .boxed_local()
    }
}
