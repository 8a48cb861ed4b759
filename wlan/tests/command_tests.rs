//! Command channel tests against the simulated firmware

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use acx_wlan::{
    ChannelState, ChipVariant, Command, CommandError, CommandWaitMode, DeviceConfig,
    FirmwareStatus, Parameter,
};
use common::{device, test_config, up_device, IrqLine};

fn hold_lock_config() -> DeviceConfig {
    DeviceConfig {
        command_wait: CommandWaitMode::HoldLock,
        ..test_config()
    }
}

#[test]
fn test_retry_limit_round_trip() {
    let (dev, bus) = up_device(test_config());
    let _irq = IrqLine::spawn(Arc::clone(&dev));

    dev.set_parameter(Parameter::ShortRetryLimit, &7u32.to_le_bytes())
        .unwrap();
    assert_eq!(bus.param(Parameter::ShortRetryLimit).unwrap(), [7, 0, 0, 0]);

    let value = dev.get_parameter(Parameter::ShortRetryLimit).unwrap();
    assert_eq!(value.len(), 4);
    assert_eq!(u32::from_le_bytes(value.try_into().unwrap()), 7);
    assert_eq!(dev.channel_state(), ChannelState::Idle);
}

#[test]
fn test_round_trip_holding_lock() {
    // No interrupt thread: the waiter polls the reason register itself.
    let (dev, _bus) = up_device(hold_lock_config());

    dev.set_parameter(Parameter::LongRetryLimit, &[9]).unwrap();
    assert_eq!(dev.get_parameter(Parameter::LongRetryLimit).unwrap(), [9, 0, 0, 0]);
    assert_eq!(dev.channel_state(), ChannelState::Idle);
}

#[test]
fn test_timeout_returns_in_time_and_leaves_idle() {
    let (dev, bus) = up_device(test_config());
    let _irq = IrqLine::spawn(Arc::clone(&dev));

    bus.set_responsive(false);
    let timeout = Duration::from_millis(20);
    let start = Instant::now();
    let err = dev
        .execute(Command::Scan, &[], timeout.as_micros() as u64)
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, CommandError::Timeout);
    assert!(err.is_retryable());
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(250), "took {:?}", elapsed);
    assert_eq!(dev.channel_state(), ChannelState::Idle);
    assert_eq!(dev.stats().command_timeouts, 1);

    // The channel is usable again.
    bus.set_responsive(true);
    dev.execute(Command::Scan, &[], 50_000).unwrap();
}

#[test]
fn test_timeout_holding_lock() {
    let (dev, bus) = up_device(hold_lock_config());
    bus.set_responsive(false);

    let start = Instant::now();
    let err = dev.get_parameter(Parameter::DtimPeriod).unwrap_err();
    assert_eq!(err, CommandError::Timeout);
    assert!(start.elapsed() < Duration::from_millis(50 + 250));
    assert_eq!(dev.channel_state(), ChannelState::Idle);
}

#[test]
fn test_firmware_error_resets_channel() {
    let (dev, bus) = up_device(test_config());
    let _irq = IrqLine::spawn(Arc::clone(&dev));

    bus.fail_next(FirmwareStatus::Rejected);
    let err = dev.set_parameter(Parameter::DtimPeriod, &[2]).unwrap_err();
    assert_eq!(err, CommandError::Firmware(FirmwareStatus::Rejected));
    assert!(!err.is_retryable());
    assert_eq!(dev.channel_state(), ChannelState::Idle);
    assert_eq!(dev.stats().firmware_errors, 1);

    dev.set_parameter(Parameter::DtimPeriod, &[2]).unwrap();
    assert_eq!(bus.param(Parameter::DtimPeriod).unwrap(), [2]);
}

#[test]
fn test_read_only_element() {
    let (dev, _bus) = up_device(hold_lock_config());
    let err = dev
        .set_parameter(Parameter::FirmwareRevision, b"Rev 9")
        .unwrap_err();
    assert_eq!(err, CommandError::Firmware(FirmwareStatus::ReadOnly));
}

#[test]
fn test_oversized_payloads_rejected_before_issue() {
    let (dev, bus) = up_device(hold_lock_config());
    let issued = bus.commands().len();

    let err = dev.set_parameter(Parameter::DtimPeriod, &[1, 2]).unwrap_err();
    assert_eq!(err, CommandError::PayloadTooLarge { len: 2, max: 1 });

    let err = dev.execute(Command::Join, &[0u8; 300], 10_000).unwrap_err();
    assert_eq!(err, CommandError::PayloadTooLarge { len: 300, max: 256 });

    assert_eq!(bus.commands().len(), issued);
    assert_eq!(dev.channel_state(), ChannelState::Idle);
}

#[test]
fn test_variant_specific_elements() {
    let (acx111, _) = up_device(hold_lock_config());
    assert_eq!(
        acx111.get_parameter(Parameter::EdThreshold).unwrap_err(),
        CommandError::UnsupportedParameter(Parameter::EdThreshold.id())
    );
    assert_eq!(acx111.get_parameter(Parameter::Antenna).unwrap().len(), 2);

    let (acx100, _) = up_device(DeviceConfig {
        variant: ChipVariant::Acx100,
        ..hold_lock_config()
    });
    assert_eq!(acx100.get_parameter(Parameter::EdThreshold).unwrap().len(), 4);
    assert_eq!(acx100.get_parameter(Parameter::Antenna).unwrap().len(), 1);
}

#[test]
fn test_commands_need_bring_up() {
    let (dev, bus) = device(test_config());
    assert_eq!(
        dev.execute(Command::Scan, &[], 10_000),
        Err(CommandError::DeviceNotReady)
    );
    assert_eq!(
        dev.get_parameter(Parameter::DtimPeriod),
        Err(CommandError::DeviceNotReady)
    );
    assert!(bus.commands().is_empty());
}

#[test]
fn test_concurrent_callers_are_serialized() {
    let (dev, bus) = up_device(test_config());
    let _irq = IrqLine::spawn(Arc::clone(&dev));
    let before = bus.commands().len();

    let workers: Vec<_> = (0..4u8)
        .map(|n| {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                for _ in 0..10 {
                    dev.set_parameter(Parameter::BeaconPeriod, &[n, 0]).unwrap();
                    let value = dev.get_parameter(Parameter::BeaconPeriod).unwrap();
                    assert_eq!(value.len(), 2);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(bus.commands().len() - before, 80);
    assert_eq!(dev.channel_state(), ChannelState::Idle);
    assert_eq!(dev.stats().command_timeouts, 0);
}
