//! Mid-stream format changes
//!
//! A sequence header announcing new dimensions must renegotiate exactly the
//! ports it makes stale, input before output, without losing a buffer, and
//! decoding must carry on in the new format afterwards.

use anyhow::{bail, Result};
use hwvdec::offload::ControlKind;
use hwvdec::simulated::{sequence_header, SimulatedBehavior};
use hwvdec::{BufferFlags, ComponentEvent, ComponentState, FrameGeometry, PortIndex};
use hwvdec_integration_tests::{TestFixture, FRAME_INTERVAL, WAIT_TIMEOUT};
use std::time::{Duration, Instant};

fn settings_changed(fixture: &mut TestFixture) -> Result<(PortIndex, FrameGeometry)> {
    match fixture.wait_event(|e| matches!(e, ComponentEvent::PortSettingsChanged { .. }))? {
        ComponentEvent::PortSettingsChanged { port, format } => Ok((port, format.geometry)),
        other => bail!("unexpected event {:?}", other),
    }
}

fn settings_changes(fixture: &TestFixture, port: PortIndex) -> usize {
    fixture.count_events(|e| matches!(e, ComponentEvent::PortSettingsChanged { port: p, .. } if *p == port))
}

fn submit_header(fixture: &mut TestFixture, geometry: FrameGeometry, timestamp: i64) -> Result<()> {
    fixture.submit(&sequence_header(geometry), timestamp, BufferFlags::CODEC_CONFIG)
}

#[test]
fn test_resolution_change_renegotiates_output() -> Result<()> {
    let hd = FrameGeometry::new(1280, 720);
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    for i in 0..3 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(3)?;
    submit_header(&mut fixture, hd, 3 * FRAME_INTERVAL)?;

    let (port, geometry) = settings_changed(&mut fixture)?;
    assert_eq!(port, PortIndex::Output);
    assert_eq!(geometry, hd);
    assert_eq!(fixture.instance.state(), ComponentState::Executing);
    fixture.renegotiate(PortIndex::Output)?;

    let definition = fixture.instance.port_definition(PortIndex::Output)?;
    assert_eq!(definition.format.geometry, hd);
    assert!(definition.buffer_size >= 1280 * 720 * 3 / 2);
    fixture.assert_conservation()?;

    for i in 3..6 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(6)?;

    let frames = fixture.frames();
    for frame in &frames[..3] {
        assert_eq!(frame.filled_len, 640 * 480 * 3 / 2);
        assert_eq!(frame.epoch, 0);
    }
    for (i, frame) in frames[3..].iter().enumerate() {
        assert_eq!(frame.filled_len, 1280 * 720 * 3 / 2);
        assert_eq!(frame.epoch, 1);
        assert_eq!(frame.timestamp, (i as i64 + 3) * FRAME_INTERVAL);
    }

    assert_eq!(settings_changes(&fixture, PortIndex::Output), 1);
    assert_eq!(settings_changes(&fixture, PortIndex::Input), 0);
    assert_eq!(fixture.instance.stats()?.reconfigurations, 1);

    // No stale-epoch output buffer reaches the engine once the new pool is in use
    let outputs = fixture.probe.for_port(PortIndex::Output);
    let first_new = outputs.iter().position(|r| r.epoch == 1).unwrap_or(outputs.len());
    assert!(first_new < outputs.len());
    assert!(outputs[first_new..].iter().all(|r| r.epoch == 1));
    assert!(fixture.probe.for_port(PortIndex::Input).iter().all(|r| r.epoch == 0));

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_large_resolution_renegotiates_both_ports() -> Result<()> {
    let full_hd = FrameGeometry::new(1920, 1080);
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;
    submit_header(&mut fixture, full_hd, FRAME_INTERVAL)?;

    let (first, _) = settings_changed(&mut fixture)?;
    assert_eq!(first, PortIndex::Input);
    fixture.renegotiate(PortIndex::Input)?;
    let input = fixture.instance.port_definition(PortIndex::Input)?;
    assert!(input.buffer_size >= 1920 * 1080 / 2);

    let (second, geometry) = settings_changed(&mut fixture)?;
    assert_eq!(second, PortIndex::Output);
    assert_eq!(geometry, full_hd);
    fixture.renegotiate(PortIndex::Output)?;
    fixture.assert_conservation()?;

    for i in 1..4 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(4)?;
    let frames = fixture.frames();
    assert!(frames[1..].iter().all(|f| f.filled_len == 1920 * 1080 * 3 / 2));

    assert_eq!(settings_changes(&fixture, PortIndex::Input), 1);
    assert_eq!(settings_changes(&fixture, PortIndex::Output), 1);
    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.epoch, 1);
    assert_eq!(ledger.output.epoch, 1);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_engine_reported_geometry_triggers_renegotiation() -> Result<()> {
    let hd = FrameGeometry::new(1280, 720);
    let mut fixture = TestFixture::builder()
        .without_inspector()
        .behavior(SimulatedBehavior {
            geometry_from_stream: true,
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;
    submit_header(&mut fixture, hd, FRAME_INTERVAL)?;

    let (port, geometry) = settings_changed(&mut fixture)?;
    assert_eq!((port, geometry), (PortIndex::Output, hd));
    fixture.renegotiate(PortIndex::Output)?;

    fixture.submit_frame(1)?;
    fixture.wait_frames(2)?;
    assert_eq!(fixture.frames()[1].filled_len, 1280 * 720 * 3 / 2);
    assert_eq!(settings_changes(&fixture, PortIndex::Output), 1);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_unload_abandons_renegotiation() -> Result<()> {
    let hd = FrameGeometry::new(1280, 720);
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;
    submit_header(&mut fixture, hd, FRAME_INTERVAL)?;
    settings_changed(&mut fixture)?;

    fixture.unload()?;
    fixture.assert_conservation()?;
    assert_eq!(fixture.instance.state(), ComponentState::Loaded);

    let output = fixture.instance.port_definition(PortIndex::Output)?;
    assert_eq!(output.format.geometry, hd);
    assert_eq!(fixture.instance.stats()?.reconfigurations, 0);
    Ok(())
}

#[test]
fn test_renegotiation_in_pause_stays_paused() -> Result<()> {
    let hd = FrameGeometry::new(1280, 720);
    let mut fixture = TestFixture::new()?;
    fixture.start()?;
    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;

    submit_header(&mut fixture, hd, FRAME_INTERVAL)?;
    assert_eq!(settings_changed(&mut fixture)?.0, PortIndex::Output);
    fixture.set_state(ComponentState::Pause)?;

    fixture.probe.clear();
    fixture.renegotiate(PortIndex::Output)?;
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !fixture.probe.controls().contains(&ControlKind::Pause) {
        assert!(Instant::now() < deadline, "engine never paused: {:?}", fixture.probe.controls());
        fixture.step(Duration::from_millis(20))?;
    }
    assert_eq!(fixture.probe.controls(), vec![ControlKind::Create, ControlKind::Pause]);

    // Nothing is decoded until the host resumes
    fixture.recycle_outputs();
    fixture.submit_frame(2)?;
    while fixture.step(Duration::from_millis(100))? {}
    assert_eq!(fixture.frames().len(), 1);

    fixture.set_state(ComponentState::Executing)?;
    fixture.wait_frames(2)?;
    assert_eq!(fixture.frames()[1].filled_len, 1280 * 720 * 3 / 2);
    let controls = fixture.probe.controls();
    assert_eq!(controls.last(), Some(&ControlKind::Resume));
    assert!(!controls.contains(&ControlKind::Start));

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}
