//! Lifecycle, port commands, flushing and fault handling

use anyhow::Result;
use hwvdec::resource::{ResourceKind, SlotArbiter};
use hwvdec::simulated::SimulatedBehavior;
use hwvdec::{
    BufferFlags, Command, CommandData, CommandKind, ComponentEvent, ComponentState, DecoderError, ErrorKind,
    ErrorSeverity, PortIndex, PortSelector,
};
use hwvdec_integration_tests::{TestFixture, FRAME_INTERVAL};
use std::time::Duration;

fn error_kind(fixture: &mut TestFixture) -> Result<(ErrorKind, ErrorSeverity)> {
    match fixture.wait_event(|e| matches!(e, ComponentEvent::Error { .. }))? {
        ComponentEvent::Error { kind, severity, .. } => Ok((kind, severity)),
        other => anyhow::bail!("unexpected event {:?}", other),
    }
}

#[test]
fn test_illegal_transitions_are_reported() -> Result<()> {
    let mut fixture = TestFixture::new()?;

    fixture.instance.send_command(Command::SetState(ComponentState::Executing))?;
    assert_eq!(error_kind(&mut fixture)?.0, ErrorKind::IncorrectStateTransition);

    fixture.instance.send_command(Command::SetState(ComponentState::Loaded))?;
    let (kind, severity) = error_kind(&mut fixture)?;
    assert_eq!(kind, ErrorKind::SameState);
    assert_eq!(severity, ErrorSeverity::Minor);

    assert_eq!(fixture.instance.state(), ComponentState::Loaded);
    fixture.to_idle()?;
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_population_outside_transition_is_refused() -> Result<()> {
    let fixture = TestFixture::new()?;
    let definition = fixture.instance.port_definition(PortIndex::Input)?;
    let err = fixture
        .instance
        .allocate_buffer(PortIndex::Input, definition.buffer_size, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncorrectStateOperation);
    Ok(())
}

#[test]
fn test_use_buffer_populates_port() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.instance.send_command(Command::SetState(ComponentState::Idle))?;

    let definition = fixture.instance.port_definition(PortIndex::Input)?;
    let small = fixture
        .instance
        .use_buffer(PortIndex::Input, vec![0; definition.buffer_size / 2], 0);
    assert!(matches!(small, Err(DecoderError::BadParameter(_))));
    for i in 0..definition.buffer_count_actual {
        let buffer = fixture
            .instance
            .use_buffer(PortIndex::Input, vec![0; definition.buffer_size], i as u64)?;
        assert_eq!(buffer.app_private, i as u64);
        fixture.pools[PortIndex::Input.slot()].push(buffer);
        fixture.allocated[PortIndex::Input.slot()] += 1;
    }
    fixture.populate(PortIndex::Output)?;
    fixture.wait_state(ComponentState::Idle)?;

    fixture.set_state(ComponentState::Executing)?;
    fixture.recycle_outputs();
    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_wait_for_resources_then_idle() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.set_state(ComponentState::WaitForResources)?;
    fixture.to_idle()?;
    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_resource_denial_keeps_loaded() -> Result<()> {
    let mut fixture = TestFixture::builder().arbiter(SlotArbiter::new(0, 1)).build()?;
    fixture.instance.send_command(Command::SetState(ComponentState::Idle))?;

    let (kind, severity) = error_kind(&mut fixture)?;
    assert_eq!(kind, ErrorKind::ResourceDenied);
    assert_eq!(severity, ErrorSeverity::Major);
    assert_eq!(fixture.instance.state(), ComponentState::Loaded);
    Ok(())
}

#[test]
fn test_shared_budget_between_instances() -> Result<()> {
    let budget = SlotArbiter::new(1, 1);
    let mut first = TestFixture::builder().arbiter(budget.share()).build()?;
    let mut second = TestFixture::builder().arbiter(budget.share()).build()?;

    first.to_idle()?;
    assert_eq!(budget.in_use(ResourceKind::Memory), 1);

    second.instance.send_command(Command::SetState(ComponentState::Idle))?;
    assert_eq!(error_kind(&mut second)?.0, ErrorKind::ResourceDenied);
    assert_eq!(second.instance.state(), ComponentState::Loaded);

    first.unload()?;
    assert_eq!(budget.in_use(ResourceKind::Memory), 0);
    assert_eq!(budget.in_use(ResourceKind::Processing), 0);

    second.to_idle()?;
    second.unload()?;
    Ok(())
}

#[test]
fn test_flush_is_idempotent() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            latency: Duration::from_millis(30),
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;
    for i in 0..3 {
        fixture.submit_frame(i)?;
    }

    fixture.instance.send_command(Command::Flush(PortSelector::All))?;
    fixture.instance.send_command(Command::Flush(PortSelector::All))?;
    for _ in 0..2 {
        for port in PortIndex::ALL {
            fixture.wait_complete(CommandKind::Flush, CommandData::Port(port))?;
        }
    }
    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.owners.offload, 0);
    assert_eq!(ledger.output.owners.offload, 0);
    fixture.assert_conservation()?;
    assert_eq!(fixture.instance.state(), ComponentState::Executing);

    // Decoding carries on after the flush
    let before = fixture.frames().len();
    fixture.submit_frame(10)?;
    fixture.wait_frames(before + 1)?;
    assert_eq!(fixture.frames()[before].timestamp, 10 * FRAME_INTERVAL);

    fixture.unload()?;
    Ok(())
}

#[test]
fn test_flush_returns_submitted_inputs_unprocessed() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            latency: Duration::from_millis(50),
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;
    for i in 0..3 {
        fixture.submit_frame(i)?;
    }
    fixture
        .instance
        .send_command(Command::Flush(PortSelector::Port(PortIndex::Input)))?;
    fixture.wait_complete(CommandKind::Flush, CommandData::Port(PortIndex::Input))?;

    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.owners.client, 4);
    assert_eq!(ledger.input.owners.offload, 0);
    assert_eq!(fixture.inputs_returned, 3);

    // Nothing submitted before the flush is decoded afterwards
    while fixture.step(Duration::from_millis(150))? {}
    assert!(fixture.frames().is_empty());
    assert_eq!(fixture.instance.stats()?.input_submitted, 3);

    fixture.submit_frame(3)?;
    fixture.wait_frames(1)?;
    assert_eq!(fixture.frames()[0].timestamp, 3 * FRAME_INTERVAL);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_port_disable_and_enable() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;
    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;

    fixture
        .instance
        .send_command(Command::PortDisable(PortSelector::Port(PortIndex::Output)))?;
    fixture.free_port(PortIndex::Output)?;
    fixture.wait_complete(CommandKind::PortDisable, CommandData::Port(PortIndex::Output))?;
    assert!(!fixture.instance.port_definition(PortIndex::Output)?.enabled);

    // Inputs are still accepted while the output port is down
    fixture.submit_frame(1)?;

    fixture
        .instance
        .send_command(Command::PortEnable(PortSelector::Port(PortIndex::Output)))?;
    fixture.populate(PortIndex::Output)?;
    fixture.wait_complete(CommandKind::PortEnable, CommandData::Port(PortIndex::Output))?;

    fixture.wait_frames(2)?;
    let frames = fixture.frames();
    assert_eq!(frames[1].timestamp, FRAME_INTERVAL);
    assert_eq!(frames[1].epoch, 1);
    fixture.assert_conservation()?;

    fixture.unload()?;
    Ok(())
}

#[test]
fn test_unresponsive_engine_trips_watchdog() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .config(|c| c.engine.watchdog_timeout_ms = 200)
        .behavior(SimulatedBehavior {
            unresponsive: true,
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.instance.send_command(Command::SetState(ComponentState::Idle))?;
    fixture.populate(PortIndex::Input)?;
    fixture.populate(PortIndex::Output)?;

    let (kind, severity) = error_kind(&mut fixture)?;
    assert_eq!(kind, ErrorKind::Hardware);
    assert_eq!(severity, ErrorSeverity::Critical);
    assert!(fixture.instance.wait_for_state(ComponentState::Invalid, Duration::from_secs(1)));

    let refused = fixture.instance.send_command(Command::SetState(ComponentState::Loaded));
    assert!(matches!(refused, Err(DecoderError::InvalidState)));

    // Buffers can still be released
    fixture.free_all()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_fatal_decode_status_invalidates() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            fail_after: Some(2),
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;
    for i in 0..3 {
        fixture.submit_frame(i)?;
    }

    let (kind, severity) = error_kind(&mut fixture)?;
    assert_eq!(kind, ErrorKind::Hardware);
    assert_eq!(severity, ErrorSeverity::Critical);
    assert_eq!(fixture.instance.state(), ComponentState::Invalid);

    let decoded = fixture.frames().len();
    assert!(decoded <= 2);
    assert!(fixture.frames().iter().all(|f| !f.flags.contains(BufferFlags::EOS)));

    fixture.free_all()?;
    fixture.assert_conservation()?;
    Ok(())
}
