//! End-to-end decoding through the simulated offload engine
//!
//! These tests drive a full host session:
//! - Loaded -> Idle -> Executing with populated pools
//! - Timestamp order of decoded frames
//! - End-of-stream propagation
//! - Teardown back to Loaded with every buffer freed

use anyhow::Result;
use hwvdec::simulated::{SimulatedBehavior, CORRUPT_FRAME_MARKER, PARTIAL_FRAME_MARKER};
use hwvdec::{BufferFlags, ComponentEvent, ComponentState, PortIndex};
use hwvdec_integration_tests::{perf_test::Throughput, TestFixture, FRAME_INTERVAL};
use std::time::Duration;

const VGA_FRAME: usize = 640 * 480 * 3 / 2;

#[test]
fn test_decode_ten_frames_in_order() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;
    assert_eq!(fixture.instance.state(), ComponentState::Executing);

    let mut throughput = Throughput::new("ten frames");
    for i in 0..10 {
        fixture.submit_frame(i)?;
        throughput.frame();
    }
    fixture.wait_frames(10)?;
    throughput.report();

    let frames = fixture.frames();
    assert_eq!(frames.len(), 10);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.timestamp, i as i64 * FRAME_INTERVAL);
        assert_eq!(frame.filled_len, VGA_FRAME);
        assert!(!frame.flags.contains(BufferFlags::EOS));
    }
    assert!(frames[0].flags.contains(BufferFlags::SYNC_FRAME));
    fixture.assert_conservation()?;

    let stats = fixture.instance.stats()?;
    assert_eq!(stats.input_submitted, 10);
    assert!(stats.fill_buffer_done >= 10);
    assert_eq!(stats.corrupt_frames, 0);

    fixture.unload()?;
    fixture.assert_conservation()?;
    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.allocated, 0);
    assert_eq!(ledger.output.allocated, 0);
    Ok(())
}

#[test]
fn test_eos_follows_frames_in_flight() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            latency: Duration::from_millis(100),
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;

    for i in 0..3 {
        fixture.submit_frame(i)?;
    }
    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.owners.offload, 3);
    assert!(fixture.frames().is_empty());

    fixture.submit_eos(3 * FRAME_INTERVAL)?;
    fixture.wait_frames(4)?;
    fixture.wait_event(|e| {
        matches!(e, ComponentEvent::BufferFlag { port: PortIndex::Output, flags } if flags.contains(BufferFlags::EOS))
    })?;

    let frames = fixture.frames();
    assert_eq!(frames.len(), 4);
    for frame in &frames[..3] {
        assert!(!frame.flags.contains(BufferFlags::EOS));
        assert!(frame.filled_len > 0);
    }
    let eos = frames[3];
    assert!(eos.flags.contains(BufferFlags::EOS));
    assert_eq!(eos.filled_len, 0);
    assert_eq!(eos.timestamp, 3 * FRAME_INTERVAL);

    let flagged = fixture.count_events(|e| {
        matches!(e, ComponentEvent::BufferFlag { port: PortIndex::Output, flags } if flags.contains(BufferFlags::EOS))
    });
    assert_eq!(flagged, 1);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_corrupt_frame_is_flagged() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    let mut payload = CORRUPT_FRAME_MARKER.to_vec();
    payload.extend_from_slice(&[0u8; 64]);
    fixture.submit(&payload, FRAME_INTERVAL, BufferFlags::NONE)?;
    fixture.submit_frame(2)?;
    fixture.wait_frames(3)?;

    let frames = fixture.frames();
    assert!(!frames[0].flags.contains(BufferFlags::DATA_CORRUPT));
    assert!(frames[1].flags.contains(BufferFlags::DATA_CORRUPT));
    assert!(!frames[2].flags.contains(BufferFlags::DATA_CORRUPT));
    assert_eq!(fixture.instance.stats()?.corrupt_frames, 1);

    fixture.unload()?;
    Ok(())
}

#[test]
fn test_partial_input_does_not_shift_timestamps() -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            latency: Duration::from_millis(20),
            decode_order_only: true,
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    let mut partial = PARTIAL_FRAME_MARKER.to_vec();
    partial.extend_from_slice(&[0u8; 32]);
    fixture.submit(&partial, FRAME_INTERVAL, BufferFlags::NONE)?;
    for i in 2..5 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(4)?;

    let timestamps: Vec<i64> = fixture.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(timestamps, vec![0, 2 * FRAME_INTERVAL, 3 * FRAME_INTERVAL, 4 * FRAME_INTERVAL]);
    assert_eq!(fixture.instance.stats()?.corrupt_frames, 0);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_pause_holds_decoding() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;
    fixture.set_state(ComponentState::Pause)?;

    fixture.submit_frame(0)?;
    while fixture.step(Duration::from_millis(100))? {}
    assert!(fixture.frames().is_empty());

    fixture.set_state(ComponentState::Executing)?;
    fixture.wait_frames(1)?;
    assert_eq!(fixture.frames()[0].timestamp, 0);

    fixture.unload()?;
    fixture.assert_conservation()?;
    Ok(())
}

#[test]
fn test_restart_after_idle() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;
    for i in 0..3 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(3)?;

    fixture.set_state(ComponentState::Idle)?;
    fixture.assert_conservation()?;
    let ledger = fixture.ledger()?;
    assert_eq!(ledger.input.owners.offload, 0);
    assert_eq!(ledger.output.owners.offload, 0);

    fixture.set_state(ComponentState::Executing)?;
    fixture.recycle_outputs();
    fixture.submit_frame(3)?;
    fixture.wait_frames(4)?;
    assert_eq!(fixture.frames()[3].timestamp, 3 * FRAME_INTERVAL);

    fixture.unload()?;
    Ok(())
}
