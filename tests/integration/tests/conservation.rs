//! Buffer conservation under randomized sessions
//!
//! Whatever the host does, every buffer is owned by exactly one party, the
//! host holds exactly the buffers the ledger credits to it, and the
//! component never loses or duplicates one.

use anyhow::Result;
use hwvdec::simulated::SimulatedBehavior;
use hwvdec::{BufferFlags, Command, CommandData, CommandKind, ComponentState, PortIndex, PortSelector};
use hwvdec_integration_tests::{TestFixture, FRAME_INTERVAL};
use proptest::prelude::*;
use std::time::Duration;

/// One host action between conservation checks
#[derive(Debug, Clone)]
enum Step {
    Frame,
    Flush(PortSelector),
    /// Pause, check, resume
    Pause,
    /// Disable, free, re-enable and repopulate a port
    CyclePort(PortIndex),
}

fn port() -> impl Strategy<Value = PortIndex> {
    prop_oneof![Just(PortIndex::Input), Just(PortIndex::Output)]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => Just(Step::Frame),
        1 => prop_oneof![Just(PortSelector::All), port().prop_map(PortSelector::Port)].prop_map(Step::Flush),
        1 => Just(Step::Pause),
        1 => port().prop_map(Step::CyclePort),
    ]
}

fn run_session(latency_ms: u64, steps: &[Step]) -> Result<()> {
    let mut fixture = TestFixture::builder()
        .behavior(SimulatedBehavior {
            latency: Duration::from_millis(latency_ms),
            ..SimulatedBehavior::default()
        })
        .build()?;
    fixture.start()?;

    let mut frames = 0u64;
    for step in steps {
        match *step {
            Step::Frame => {
                fixture.submit_frame(frames)?;
                frames += 1;
            }
            Step::Flush(selector) => {
                fixture.instance.send_command(Command::Flush(selector))?;
                for port in selector.ports() {
                    fixture.wait_complete(CommandKind::Flush, CommandData::Port(port))?;
                }
            }
            Step::Pause => {
                fixture.set_state(ComponentState::Pause)?;
                fixture.assert_conservation()?;
                fixture.set_state(ComponentState::Executing)?;
                fixture.recycle_outputs();
            }
            Step::CyclePort(port) => {
                fixture
                    .instance
                    .send_command(Command::PortDisable(PortSelector::Port(port)))?;
                fixture.free_port(port)?;
                fixture.wait_complete(CommandKind::PortDisable, CommandData::Port(port))?;
                fixture.assert_conservation()?;

                fixture
                    .instance
                    .send_command(Command::PortEnable(PortSelector::Port(port)))?;
                fixture.populate(port)?;
                fixture.wait_complete(CommandKind::PortEnable, CommandData::Port(port))?;
                fixture.recycle_outputs();
            }
        }
        fixture.assert_conservation()?;
    }

    fixture.submit_eos(frames as i64 * FRAME_INTERVAL)?;
    fixture.run_until(true, |f| f.outputs.iter().any(|o| o.flags.contains(BufferFlags::EOS)))?;
    fixture.assert_conservation()?;

    let stats = fixture.instance.stats()?;
    anyhow::ensure!(stats.input_submitted <= frames + 1, "{} inputs submitted", stats.input_submitted);
    anyhow::ensure!(fixture.frames().len() as u64 <= frames + 1, "{} frames out", fixture.frames().len());

    fixture.unload()?;
    fixture.assert_conservation()?;
    let ledger = fixture.ledger()?;
    anyhow::ensure!(ledger.input.allocated == 0 && ledger.output.allocated == 0, "pools left: {:?}", ledger);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_ledger_conserved(latency_ms in 0u64..20, steps in proptest::collection::vec(step(), 1..16)) {
        let result = run_session(latency_ms, &steps);
        prop_assert!(result.is_ok(), "{:?}", result.err());
    }
}
