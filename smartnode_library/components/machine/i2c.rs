//! Shared I2C bus
//!
//! ```json
//! "i2c": {
//!     "package": "machine",
//!     "component": "I2C",
//!     "constructor_args": {"backend": "linux", "device": "/dev/i2c-1"}
//! }
//! ```
//!
//! Sensors on the bus take it by reference (`"constructor_args": ["i2c"]`).

use std::cell::RefCell;
use std::rc::Rc;

use smartnode_core::core::{unknown_function, CallFuture, Capability, Component};
use smartnode_core::error::NodeResult;
use smartnode_core::loader::{ComponentFactory, ResolvedArgs};

use crate::drivers::{DriverStatus, I2cDriver, I2cDriverBackend, SimulationI2cDriver};

pub const VERSION: &str = "1.1.0";
pub const DEFAULT_DEVICE: &str = "/dev/i2c-1";

pub struct I2cBus {
    driver: RefCell<I2cDriver>,
}

impl I2cBus {
    /// Take ownership of `driver` and initialize it
    pub fn new(mut driver: I2cDriver) -> NodeResult<Self> {
        driver.init()?;
        Ok(Self {
            driver: RefCell::new(driver),
        })
    }

    pub fn simulation() -> NodeResult<Self> {
        Self::new(I2cDriver::simulation())
    }

    pub fn backend(&self) -> I2cDriverBackend {
        self.driver.borrow().backend()
    }

    pub fn status(&self) -> DriverStatus {
        self.driver.borrow().status()
    }

    pub fn read(&self, addr: u16, len: usize) -> NodeResult<Vec<u8>> {
        self.driver.borrow_mut().read_bytes(addr, len)
    }

    pub fn write(&self, addr: u16, data: &[u8]) -> NodeResult<()> {
        self.driver.borrow_mut().write_bytes(addr, data)
    }

    /// Run `f` against the simulated backend; `None` on real hardware
    pub fn simulate<R>(&self, f: impl FnOnce(&mut SimulationI2cDriver) -> R) -> Option<R> {
        self.driver.borrow_mut().as_simulation_mut().map(f)
    }

    pub fn factory() -> ComponentFactory {
        ComponentFactory::new("machine", "I2C", VERSION, |ctx| {
            let backend = I2cDriverBackend::from_name(&ctx.args.string_or(0, "backend", "simulation")?)?;
            let device = ctx.args.string_or(1, "device", DEFAULT_DEVICE)?;
            let bus = I2cBus::new(I2cDriver::new(backend, &device)?)?;
            log::info!("I2C bus '{}' ready ({} backend)", ctx.name, backend.as_str());
            Ok(Rc::new(bus))
        })
        .with_capabilities(&[Capability::Bus])
    }
}

impl Component for I2cBus {
    fn call(self: Rc<Self>, function: &str, _args: ResolvedArgs) -> CallFuture {
        unknown_function(function)
    }
}
