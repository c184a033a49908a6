// A node booting the standard components from one descriptor file
use std::time::Duration;

use smartnode_core::communication::SimulatedBroker;
use smartnode_core::loader::{DescriptorSet, LoadStatus};
use smartnode_core::{NodeSettings, SmartNode};
use smartnode_library::components::sensors::htu21d::{
    encode_reply, TRIGGER_HUMIDITY, TRIGGER_TEMPERATURE,
};
use smartnode_library::{default_factories, Hcsr04, I2cBus, WaterSensor};

const DESCRIPTORS: &str = r#"{
    "_order": ["i2c", "htu", "sonar", "basement"],
    "i2c": {"package": "machine", "component": "I2C"},
    "htu": {
        "package": "sensors.htu21d",
        "component": "HTU21D",
        "constructor_args": ["i2c"],
        "call_function_regularly": "temp_humid",
        "call_interval": 60
    },
    "sonar": {
        "package": "sensors.hcsr04",
        "component": "HCSR04",
        "constructor_args": {"pin_trigger": "D5", "pin_echo": "D6", "temp_sensor": "htu", "interval": 30}
    },
    "basement": {
        "package": "sensors.waterSensor",
        "component": "WaterSensor",
        "constructor_args": {"adc": 33, "simulated_voltage": 1.0},
        "call_function_regularly": "water",
        "call_interval": 1
    }
}"#;

fn settings() -> NodeSettings {
    let mut settings = NodeSettings::default();
    settings.device_id = "n1".to_string();
    settings.supervisor.enabled = false;
    settings
}

fn payloads(broker: &SimulatedBroker, topic: &str) -> Vec<String> {
    broker
        .published()
        .iter()
        .filter(|m| m.topic == topic)
        .filter_map(|m| m.payload_str().map(str::to_string))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_standard_components_run_together() {
    let broker = SimulatedBroker::new();
    let node = SmartNode::new(settings(), broker.link(), default_factories())
        .unwrap()
        .with_descriptors(DescriptorSet::from_json(DESCRIPTORS).unwrap());

    let summary = node.scheduler().run_until(node.boot()).await;
    assert!(summary.report.is_clean(), "{:?}", summary.report);
    for name in ["i2c", "htu", "sonar", "basement"] {
        assert_eq!(summary.report.status(name), Some(LoadStatus::Loaded), "{}", name);
    }

    let registry = node.registry();
    registry
        .get_as::<I2cBus>("i2c")
        .unwrap()
        .simulate(|sim| {
            sim.set_reply(0x40, TRIGGER_TEMPERATURE, encode_reply(0x683A).to_vec());
            sim.set_reply(0x40, TRIGGER_HUMIDITY, encode_reply(0x4E85).to_vec());
        })
        .unwrap();
    assert!(registry.sensor("sonar").is_some());
    assert_eq!(
        registry.get_as::<Hcsr04>("sonar").unwrap().interval(),
        Duration::from_secs(30)
    );

    node.scheduler().run_for(Duration::from_secs(125)).await;

    let temperatures = payloads(&broker, "home/n1/htu/temperature");
    assert!(temperatures.len() >= 2);
    assert!(temperatures.iter().all(|t| t == "24.69"));

    // compensated with the HTU21D's 24.69°C
    let distances = payloads(&broker, "home/n1/sonar");
    assert!(distances.len() >= 4);
    assert!(distances.iter().all(|d| d == "100.92"));

    assert_eq!(payloads(&broker, "home/n1/basement"), vec!["wet"]);
    assert_eq!(registry.get_as::<WaterSensor>("basement").unwrap().last_state(), Some(true));

    assert_eq!(
        broker.retained("home/n1/version/htu").unwrap().payload_str(),
        Some("3.0.2")
    );
    assert!(broker.retained("home/n1/components").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bad_temperature_reference_only_fails_the_sonar() {
    let broker = SimulatedBroker::new();
    let set = DescriptorSet::from_json(
        r#"{
            "_order": ["i2c", "sonar"],
            "i2c": {"package": "machine", "component": "I2C"},
            "sonar": {"package": "sensors.hcsr04", "component": "HCSR04",
                      "constructor_args": {"temp_sensor": "i2c"}}
        }"#,
    )
    .unwrap();
    let node = SmartNode::new(settings(), broker.link(), default_factories())
        .unwrap()
        .with_descriptors(set);

    let summary = node.scheduler().run_until(node.boot()).await;
    assert_eq!(summary.report.status("i2c"), Some(LoadStatus::Loaded));
    assert_eq!(summary.report.status("sonar"), Some(LoadStatus::Failed));
    assert_eq!(node.registry().names(), vec!["i2c"]);
}
