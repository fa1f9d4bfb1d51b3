//! Buffer marks
//!
//! A mark aimed at this component is echoed once the marked input has been
//! consumed; a mark aimed further downstream rides along with the decoded
//! frame.

use anyhow::Result;
use hwvdec::{Command, ComponentEvent, ComponentId, Mark, PortIndex};
use hwvdec_integration_tests::TestFixture;

#[test]
fn test_mark_for_this_component_is_echoed() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    let own = ComponentId(fixture.instance.id());
    let mark = Mark { target: own, data: 42 };
    fixture.instance.send_command(Command::MarkBuffer(PortIndex::Input, mark))?;
    fixture.submit_frame(0)?;

    let event = fixture.wait_event(|e| matches!(e, ComponentEvent::MarkReached { .. }))?;
    assert_eq!(event, ComponentEvent::MarkReached { mark });
    fixture.wait_frames(1)?;
    assert_eq!(fixture.frames()[0].mark, None);

    fixture.unload()?;
    Ok(())
}

#[test]
fn test_downstream_mark_travels_with_frame() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    fixture.wait_frames(1)?;
    let mark = Mark {
        target: ComponentId(99),
        data: 7,
    };
    fixture.instance.send_command(Command::MarkBuffer(PortIndex::Input, mark))?;
    fixture.submit_frame(1)?;
    fixture.submit_frame(2)?;
    fixture.wait_frames(3)?;

    let marks: Vec<Option<Mark>> = fixture.frames().iter().map(|f| f.mark).collect();
    assert_eq!(marks, vec![None, Some(mark), None]);
    assert_eq!(fixture.count_events(|e| matches!(e, ComponentEvent::MarkReached { .. })), 0);

    fixture.unload()?;
    Ok(())
}
