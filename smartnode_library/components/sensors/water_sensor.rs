//! Two-wire water sensor
//!
//! A resistor pulls the ADC pin up; once water conducts between the two wires the
//! voltage drops below the cutoff.
//!
//! ```json
//! "basement": {
//!     "package": "sensors.waterSensor",
//!     "component": "WaterSensor",
//!     "constructor_args": {"adc": 33, "cutoff_voltage": 3.0, "interval": 600},
//!     "call_function_regularly": "water",
//!     "call_interval": 1
//! }
//! ```
//!
//! State changes are published immediately (retained `wet`/`dry`), unchanged
//! state again once `interval` has passed since the last publish. The polling
//! cadence comes from the descriptor's `call_interval`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde_json::Value;
use smartnode_core::communication::{Message, SessionHandle};
use smartnode_core::core::{unknown_function, CallFuture, Capability, Component, Reading, Sensor};
use smartnode_core::error::{NodeError, NodeResult};
use smartnode_core::loader::{ComponentFactory, ResolvedArgs};
use tokio::time::Instant;

use super::publish_arg;
use crate::drivers::SimulationAdcDriver;

pub const VERSION: &str = "0.4.0";

pub struct WaterSensor {
    adc: RefCell<SimulationAdcDriver>,
    cutoff_voltage: f64,
    interval: Duration,
    topic: String,
    session: SessionHandle,
    last_state: Cell<Option<bool>>,
    last_publish: Cell<Option<Instant>>,
}

impl WaterSensor {
    /// `cutoff_voltage` defaults to the ADC's full scale
    pub fn new(
        mut adc: SimulationAdcDriver,
        cutoff_voltage: Option<f64>,
        interval: Duration,
        topic: impl Into<String>,
        session: SessionHandle,
    ) -> NodeResult<Self> {
        adc.init()?;
        let cutoff_voltage = cutoff_voltage.unwrap_or_else(|| adc.max_voltage());
        Ok(Self {
            adc: RefCell::new(adc),
            cutoff_voltage,
            interval,
            topic: topic.into(),
            session,
            last_state: Cell::new(None),
            last_publish: Cell::new(None),
        })
    }

    pub fn cutoff_voltage(&self) -> f64 {
        self.cutoff_voltage
    }

    /// Last known state, `None` before the first reading
    pub fn last_state(&self) -> Option<bool> {
        self.last_state.get()
    }

    pub fn adc(&self) -> std::cell::RefMut<'_, SimulationAdcDriver> {
        self.adc.borrow_mut()
    }

    /// True when the sensor reads wet
    pub fn water(&self, publish: bool) -> NodeResult<bool> {
        let voltage = self.adc.borrow_mut().read_voltage()?;
        let wet = voltage < self.cutoff_voltage;

        let changed = self.last_state.get() != Some(wet);
        let due = self
            .last_publish
            .get()
            .map_or(true, |at| at.elapsed() > self.interval);
        if publish && (changed || due) {
            let payload = if wet { "wet" } else { "dry" };
            self.session
                .publish(Message::new(self.topic.clone(), payload).retained(true));
            self.last_publish.set(Some(Instant::now()));
        }
        self.last_state.set(Some(wet));
        Ok(wet)
    }

    pub fn factory() -> ComponentFactory {
        ComponentFactory::new("sensors.waterSensor", "WaterSensor", VERSION, |ctx| {
            let pin = match ctx.args.value(0, "adc") {
                Some(Value::String(pin)) => pin.clone(),
                Some(Value::Number(pin)) => pin.to_string(),
                _ => return Err(NodeError::invalid_input("missing ADC pin argument 'adc'")),
            };
            let cutoff_voltage = match ctx.args.value(1, "cutoff_voltage") {
                Some(_) => Some(ctx.args.f64_or(1, "cutoff_voltage", 0.0)?),
                None => None,
            };
            let interval = ctx.args.f64_or(
                2,
                "interval",
                ctx.node.default_call_interval().as_secs_f64(),
            )?;
            if !(interval >= 0.0 && interval.is_finite()) {
                return Err(NodeError::invalid_input("interval must not be negative"));
            }
            let interval = Duration::try_from_secs_f64(interval).map_err(|_| {
                NodeError::invalid_input(format!("interval {}s out of range", interval))
            })?;
            let topic = ctx
                .args
                .string_or(3, "mqtt_topic", &ctx.node.topics().device(ctx.name))?;
            let simulated_voltage = ctx.args.f64_or(4, "simulated_voltage", 3.3)?;

            let mut adc = SimulationAdcDriver::new(pin);
            adc.set_voltage(simulated_voltage);
            let sensor = WaterSensor::new(
                adc,
                cutoff_voltage,
                interval,
                topic,
                ctx.node.session().clone(),
            )?;
            Ok(Rc::new(sensor))
        })
        .with_capabilities(&[Capability::Sensor, Capability::Publisher])
    }
}

impl Component for WaterSensor {
    fn functions(&self) -> &'static [&'static str] {
        &["water"]
    }

    fn call(self: Rc<Self>, function: &str, args: ResolvedArgs) -> CallFuture {
        match function {
            "water" => {
                let result = publish_arg(&args).and_then(|publish| self.water(publish).map(drop));
                async move { result }.boxed_local()
            }
            other => unknown_function(other),
        }
    }

    fn as_sensor(self: Rc<Self>) -> Option<Rc<dyn Sensor>> {
        Some(self)
    }
}

impl Sensor for WaterSensor {
    fn read(self: Rc<Self>, publish: bool) -> LocalBoxFuture<'static, NodeResult<Reading>> {
        let reading = self
            .water(publish)
            .map(|wet| Reading::single("water", if wet { 1.0 } else { 0.0 }, ""));
        async move { reading }.boxed_local()
    }
}
