//! Delegates and instrument groups over the mock station.

mod common;

use rust_labctl::error::InstrumentError;
use rust_labctl::group::{ChannelTypeRegistry, GroupSpec, InstrumentGroup};
use rust_labctl::parameter::{DelegateParameter, NamedValue};
use rust_labctl::ParameterValue;

fn group(yaml: &str) -> GroupSpec {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn device_gate_forwards_to_dac_channel() {
    let (registry, dac, _lockin) = common::dac_and_lockin();
    let chip = InstrumentGroup::new(
        "chip",
        group(
            r#"
submodules:
  device1:
    parameters:
      gate: [dac.ch01.voltage]
"#,
        ),
    )
    .build(&registry, &ChannelTypeRegistry::new())
    .unwrap();

    let device1 = chip.submodule("device1").unwrap();
    let gate = device1.parameter("gate").unwrap();
    gate.set(0.75.into()).unwrap();
    assert_eq!(dac.get("ch01.voltage").unwrap(), ParameterValue::Float(0.75));
    assert_eq!(gate.get().unwrap(), ParameterValue::Float(0.75));

    let underlying = gate.underlying_instrument().unwrap();
    assert_eq!(underlying.id(), dac.id());
    assert_ne!(underlying.id(), device1.id());
    assert_eq!(gate.owner().unwrap().id(), device1.id());
}

#[test]
fn delegate_unit_enforcement() {
    let (registry, _dac, _lockin) = common::dac_and_lockin();
    let source = registry.resolve_parameter("dac.ch01.voltage").unwrap();

    let err = DelegateParameter::builder("gate")
        .source(source.clone())
        .unit("mV")
        .build()
        .unwrap_err();
    assert!(matches!(err, InstrumentError::UnitMismatch { .. }));

    let inherited = DelegateParameter::new("gate", source).unwrap();
    assert_eq!(inherited.unit(), "V");
}

#[test]
fn delegate_from_path_and_closed_source() {
    let (registry, dac, _lockin) = common::dac_and_lockin();
    let gate = DelegateParameter::from_path("gate", "dac.ch02.voltage", &registry).unwrap();
    assert_eq!(gate.source_path().as_deref(), Some("dac.ch02.voltage"));

    dac.close();
    assert!(matches!(
        gate.get(),
        Err(InstrumentError::InstrumentClosed(_))
    ));
}

#[test]
fn ramped_delegate_lands_exactly_on_target() {
    let (registry, dac, _lockin) = common::dac_and_lockin();
    let gate = DelegateParameter::from_path("gate", "dac.ch01.voltage", &registry).unwrap();
    gate.set_attribute("step", &0.3.into()).unwrap();
    gate.set(1.0.into()).unwrap();
    assert_eq!(dac.get("ch01.voltage").unwrap(), ParameterValue::Float(1.0));
}

#[test]
fn group_mixing_instruments_reports_each_once() {
    let (registry, dac, lockin) = common::dac_and_lockin();
    let chip = InstrumentGroup::new(
        "chip",
        group(
            r#"
submodules:
  device1:
    parameters:
      drive: [dac.ch01.voltage, dac.ch02.voltage, lockin.amplitude]
"#,
        ),
    )
    .build(&registry, &ChannelTypeRegistry::new())
    .unwrap();

    let drive = chip.resolve_parameter("device1.drive").unwrap();
    let ids: Vec<_> = drive.underlying_instruments().iter().map(|i| i.id()).collect();
    assert_eq!(ids, vec![dac.id(), lockin.id()]);
    assert_eq!(drive.unit(), "V");

    drive.set(0.5.into()).unwrap();
    assert_eq!(
        drive.get().unwrap(),
        ParameterValue::Array(vec![0.5.into(), 0.5.into(), 0.5.into()])
    );
}

#[test]
fn closing_group_leaves_sources_open() {
    let (registry, dac, _lockin) = common::dac_and_lockin();
    let chip = InstrumentGroup::new(
        "chip",
        group("submodules:\n  device1:\n    channels:\n      gate_channel: dac.ch01\n"),
    )
    .build(&registry, &ChannelTypeRegistry::new())
    .unwrap();

    chip.close();
    assert!(!registry.contains("chip"));
    assert!(dac.get("ch01.voltage").is_ok());
}
