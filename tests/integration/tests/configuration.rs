//! Configuration files applied to a running instance

use anyhow::Result;
use hwvdec::simulated::CORRUPT_FRAME_MARKER;
use hwvdec::{
    BufferFlags, ComponentEvent, ComponentState, CompressionKind, Config, CropRect, DecoderError, ErrorKind, PortIndex,
    SettingIndex, SettingValue,
};
use hwvdec_integration_tests::{TestFixture, FRAME_INTERVAL};
use tempfile::TempDir;

#[test]
fn test_config_file_sizes_pools() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hwvdec.toml");

    let mut config = Config::default();
    config.component.codec = CompressionKind::Mpeg4;
    config.output_port.buffer_count_actual = 6;
    config.save_to(&path)?;

    let loaded = Config::from_file(&path)?;
    let mut fixture = TestFixture::builder().config(|c| *c = loaded).build()?;
    let output = fixture.instance.port_definition(PortIndex::Output)?;
    assert_eq!(output.buffer_count_actual, 6);
    let input = fixture.instance.port_definition(PortIndex::Input)?;
    assert_eq!(input.format.compression, CompressionKind::Mpeg4);

    fixture.start()?;
    assert_eq!(fixture.allocated[PortIndex::Output.slot()], 6);
    for i in 0..8 {
        fixture.submit_frame(i)?;
    }
    fixture.wait_frames(8)?;
    fixture.unload()?;
    assert_eq!(fixture.instance.state(), ComponentState::Loaded);
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = TestFixture::builder()
        .config(|c| c.output_port.buffer_count_actual = 0)
        .build();
    let err = result.err().and_then(|e| e.downcast::<DecoderError>().ok());
    assert!(matches!(err, Some(DecoderError::Config(_))));
}

#[test]
fn test_port_definition_fixed_while_enabled() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    let mut definition = fixture.instance.port_definition(PortIndex::Output)?;
    definition.buffer_count_actual = 5;
    fixture.instance.set_port_definition(definition.clone())?;
    assert_eq!(fixture.instance.port_definition(PortIndex::Output)?.buffer_count_actual, 5);

    fixture.to_idle()?;
    definition.buffer_count_actual = 3;
    let refused = fixture.instance.set_port_definition(definition);
    assert!(matches!(refused, Err(DecoderError::IncorrectStateOperation(_))));
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_roles_follow_input_compression() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    let roles: Vec<&str> = (0..).map_while(|i| fixture.instance.role_enum(i)).collect();
    assert_eq!(roles.len(), 5);
    assert!(roles.contains(&"video_decoder.wmv"));
    assert_eq!(fixture.instance.role()?, "video_decoder.avc");

    fixture.instance.set_role("video_decoder.mpeg4")?;
    assert_eq!(fixture.instance.role()?, "video_decoder.mpeg4");
    let input = fixture.instance.port_definition(PortIndex::Input)?;
    assert_eq!(input.format.compression, CompressionKind::Mpeg4);

    assert!(fixture.instance.set_role("audio_decoder.aac").is_err());
    fixture.to_idle()?;
    assert!(matches!(
        fixture.instance.set_role("video_decoder.avc"),
        Err(DecoderError::IncorrectStateOperation(_))
    ));
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_error_reporting_raises_corrupt_frame_events() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    let reporting = fixture.instance.setting(SettingIndex::ErrorReporting)?;
    assert_eq!(reporting, SettingValue::ErrorReporting(false));
    fixture.instance.set_setting(SettingValue::ErrorReporting(true))?;
    fixture.start()?;

    fixture.submit_frame(0)?;
    let mut payload = CORRUPT_FRAME_MARKER.to_vec();
    payload.extend_from_slice(&[0u8; 64]);
    fixture.submit(&payload, FRAME_INTERVAL, BufferFlags::NONE)?;
    fixture.wait_frames(2)?;

    let event = fixture.wait_event(|e| matches!(e, ComponentEvent::Error { .. }))?;
    match event {
        ComponentEvent::Error { kind, port, .. } => {
            assert_eq!(kind, ErrorKind::StreamCorrupt);
            assert_eq!(port, Some(PortIndex::Output));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(fixture.instance.state(), ComponentState::Executing);
    fixture.unload()?;
    Ok(())
}

#[test]
fn test_output_crop_is_read_only() -> Result<()> {
    let fixture = TestFixture::new()?;
    let crop = fixture.instance.setting(SettingIndex::OutputCrop)?;
    assert_eq!(
        crop,
        SettingValue::OutputCrop(CropRect {
            left: 0,
            top: 0,
            width: 640,
            height: 480,
        })
    );
    let refused = fixture.instance.set_setting(crop);
    assert!(matches!(refused, Err(DecoderError::UnsupportedSetting(_))));
    Ok(())
}

#[test]
fn test_error_reporting_unsupported_for_wmv() -> Result<()> {
    let fixture = TestFixture::builder()
        .config(|c| c.component.codec = CompressionKind::Wmv)
        .build()?;
    let read = fixture.instance.setting(SettingIndex::ErrorReporting);
    assert!(matches!(read, Err(DecoderError::UnsupportedSetting(_))));
    let write = fixture.instance.set_setting(SettingValue::ErrorReporting(true));
    assert!(matches!(write, Err(DecoderError::UnsupportedSetting(_))));
    Ok(())
}
