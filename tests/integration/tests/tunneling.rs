//! Ports tunneled to a peer component

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use hwvdec::{BufferHeader, ComponentState, CompressionKind, DecoderError, PortIndex, TunnelPeer};
use hwvdec_integration_tests::{TestFixture, FRAME_INTERVAL, WAIT_TIMEOUT};

/// Downstream sink collecting decoded frames
struct ChannelSink {
    compression: CompressionKind,
    frames: Sender<BufferHeader>,
}

impl TunnelPeer for ChannelSink {
    fn compression(&self) -> CompressionKind {
        self.compression
    }

    fn deliver(&mut self, buffer: BufferHeader) {
        let _ = self.frames.send(buffer);
    }
}

fn sink() -> (ChannelSink, Receiver<BufferHeader>) {
    let (frames, rx) = unbounded();
    (
        ChannelSink {
            compression: CompressionKind::Unused,
            frames,
        },
        rx,
    )
}

fn receive(rx: &Receiver<BufferHeader>, count: usize) -> Result<Vec<BufferHeader>> {
    (0..count).map(|_| Ok(rx.recv_timeout(WAIT_TIMEOUT)?)).collect()
}

#[test]
fn test_output_tunnel_delivers_frames_to_peer() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    let (peer, frames) = sink();
    let tunnel = fixture.instance.tunnel(PortIndex::Output, peer)?;
    assert_eq!(tunnel.port(), PortIndex::Output);
    fixture.start()?;

    for i in 0..3 {
        fixture.submit_frame(i)?;
    }
    let held = receive(&frames, 3)?;
    let timestamps: Vec<i64> = held.iter().map(|b| b.timestamp).collect();
    assert_eq!(timestamps, vec![0, FRAME_INTERVAL, 2 * FRAME_INTERVAL]);
    assert!(held.iter().all(|b| b.filled_len > 0));
    assert!(fixture.outputs.is_empty());
    fixture.assert_conservation_with_peer([0, 3])?;

    for buffer in held {
        tunnel.give_back(buffer).map_err(|b| anyhow::anyhow!("{} refused", b.handle()))?;
    }
    fixture.submit_frame(3)?;
    let next = receive(&frames, 1)?;
    assert_eq!(next[0].timestamp, 3 * FRAME_INTERVAL);

    let stats = fixture.instance.stats()?;
    assert_eq!(stats.tunnel_deliveries, 4);
    assert_eq!(stats.fill_buffer_done, 0);

    for buffer in next {
        tunnel.give_back(buffer).map_err(|b| anyhow::anyhow!("{} refused", b.handle()))?;
    }
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_peer_buffers_reach_host_after_stop() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    let (peer, frames) = sink();
    let tunnel = fixture.instance.tunnel(PortIndex::Output, peer)?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    fixture.submit_frame(1)?;
    let held = receive(&frames, 2)?;

    fixture.set_state(ComponentState::Idle)?;
    fixture.assert_conservation_with_peer([0, 2])?;

    for buffer in held {
        tunnel.give_back(buffer).map_err(|b| anyhow::anyhow!("{} refused", b.handle()))?;
    }
    let out = PortIndex::Output.slot();
    fixture.run_until(false, |f| f.pools[out].len() == f.allocated[out])?;
    fixture.assert_conservation()?;

    fixture.unload()?;
    fixture.instance.untunnel(PortIndex::Output)?;
    Ok(())
}

#[test]
fn test_tunnel_setup_is_checked() -> Result<()> {
    let mut fixture = TestFixture::new()?;

    let (peer, _frames) = sink();
    let mismatched = fixture.instance.tunnel(PortIndex::Input, peer);
    assert!(matches!(mismatched, Err(DecoderError::PortsNotCompatible(_))));

    fixture.start()?;
    let (peer, _frames) = sink();
    let late = fixture.instance.tunnel(PortIndex::Output, peer);
    assert!(matches!(late, Err(DecoderError::IncorrectStateOperation(_))));

    fixture.unload()?;
    Ok(())
}
