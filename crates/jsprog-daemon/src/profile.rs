//! XML profile parsing.
//!
//! A profile document looks like:
//!
//! ```xml
//! <jsprogProfile>
//!   <prologue>-- shared Lua code</prologue>
//!   <key code="0x120">press_key(KEY_G) release_key(KEY_G)</key>
//!   <axis name="ABS_X">move_rel(REL_X, value)</axis>
//!   <epilogue>-- run last</epilogue>
//! </jsprogProfile>
//! ```
//!
//! Control elements carry either a `code` attribute (decimal or
//! `0x`-prefixed hex) or a symbolic `name` resolved through the static
//! tables. Entries without a resolvable code or without body text are
//! skipped with a warning.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::warn;

use jsprog_input::names;
use jsprog_types::{ControlKind, Profile, ProfileControl};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("malformed profile XML: {0}")]
    Malformed(String),

    #[error("invalid root element")]
    InvalidRoot,
}

/// Which direct child of the root we are collecting text for.
enum Section {
    Prologue,
    Epilogue,
    Control { kind: ControlKind, code: Option<u16> },
    Ignored,
}

/// Parse a profile document.
pub fn parse(xml: &str) -> Result<Profile, ProfileError> {
    let mut reader = Reader::from_str(xml);
    let mut profile = Profile::default();

    let mut saw_root = false;
    let mut depth = 0usize;
    let mut section: Option<Section> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ProfileError::Malformed(e.to_string()))?;
        match event {
            Event::Start(start) => {
                depth += 1;
                let name = start.name().as_ref().to_vec();
                if depth == 1 {
                    if name != b"jsprogProfile" {
                        return Err(ProfileError::InvalidRoot);
                    }
                    saw_root = true;
                } else if depth == 2 {
                    text.clear();
                    section = Some(match name.as_slice() {
                        b"prologue" => Section::Prologue,
                        b"epilogue" => Section::Epilogue,
                        b"key" => Section::Control {
                            kind: ControlKind::Key,
                            code: control_code(&start, ControlKind::Key),
                        },
                        b"axis" => Section::Control {
                            kind: ControlKind::Axis,
                            code: control_code(&start, ControlKind::Axis),
                        },
                        _ => Section::Ignored,
                    });
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    finish_section(&mut profile, section.take(), &text);
                    text.clear();
                }
                depth = depth.saturating_sub(1);
            }
            Event::Empty(empty) => {
                if depth == 1 {
                    let name = empty.name().as_ref().to_vec();
                    if matches!(name.as_slice(), b"key" | b"axis") {
                        warn!("control element without Lua code, skipping");
                    }
                }
            }
            Event::Text(t) => {
                if section.is_some() && depth == 2 {
                    let chunk = t
                        .unescape()
                        .map_err(|e| ProfileError::Malformed(e.to_string()))?;
                    text.push_str(&chunk);
                }
            }
            Event::CData(cdata) => {
                if section.is_some() && depth == 2 {
                    text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ProfileError::InvalidRoot);
    }
    Ok(profile)
}

fn finish_section(profile: &mut Profile, section: Option<Section>, text: &str) {
    match section {
        Some(Section::Prologue) => {
            if !text.is_empty() {
                profile.prologue = Some(text.to_string());
            }
        }
        Some(Section::Epilogue) => {
            if !text.is_empty() {
                profile.epilogue = Some(text.to_string());
            }
        }
        Some(Section::Control { kind, code }) => {
            let Some(code) = code else {
                warn!(kind = %kind, "control element has no valid code or name attribute, skipping");
                return;
            };
            if text.trim().is_empty() {
                warn!(kind = %kind, code, "control element has no Lua code, skipping");
                return;
            }
            profile.controls.push(ProfileControl {
                kind,
                code,
                body: text.to_string(),
            });
        }
        Some(Section::Ignored) | None => {}
    }
}

/// Resolve the `code` or `name` attribute of a control element.
fn control_code(start: &quick_xml::events::BytesStart<'_>, kind: ControlKind) -> Option<u16> {
    let mut code = None;
    let mut name = None;
    for attr in start.attributes().flatten() {
        match attr.key.as_ref() {
            b"code" => {
                code = attr
                    .unescape_value()
                    .ok()
                    .and_then(|v| parse_code(&v));
            }
            b"name" => {
                name = attr.unescape_value().ok().map(|v| v.into_owned());
            }
            _ => {}
        }
    }
    code.or_else(|| {
        name.and_then(|n| match kind {
            ControlKind::Key => names::key_from_name(&n),
            ControlKind::Axis => names::axis_from_name(&n),
        })
    })
}

fn parse_code(value: &str) -> Option<u16> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document() {
        let xml = r#"
<jsprogProfile>
  <prologue>count = 0</prologue>
  <key code="0x120">press_key(KEY_G)</key>
  <key name="BTN_THUMB">press_key(KEY_A)</key>
  <axis name="ABS_X">move_rel(REL_X, value)</axis>
  <epilogue>ready = true</epilogue>
</jsprogProfile>"#;
        let profile = parse(xml).unwrap();
        assert_eq!(profile.prologue.as_deref(), Some("count = 0"));
        assert_eq!(profile.epilogue.as_deref(), Some("ready = true"));
        assert_eq!(profile.controls.len(), 3);
        assert_eq!(profile.controls[0].kind, ControlKind::Key);
        assert_eq!(profile.controls[0].code, 0x120);
        assert_eq!(profile.controls[1].code, 0x121);
        assert_eq!(profile.controls[2].kind, ControlKind::Axis);
        assert_eq!(profile.controls[2].code, 0x00);
    }

    #[test]
    fn decimal_code_and_cdata_body() {
        let xml = "<jsprogProfile><key code=\"288\"><![CDATA[if value ~= 0 then press_key(KEY_1) end]]></key></jsprogProfile>";
        let profile = parse(xml).unwrap();
        assert_eq!(profile.controls[0].code, 288);
        assert!(profile.controls[0].body.contains("KEY_1"));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let xml = r#"
<jsprogProfile>
  <key name="KEY_BOGUS">press_key(KEY_G)</key>
  <key code="0x120"></key>
  <key code="0x121">press_key(KEY_G)</key>
</jsprogProfile>"#;
        let profile = parse(xml).unwrap();
        assert_eq!(profile.controls.len(), 1);
        assert_eq!(profile.controls[0].code, 0x121);
    }

    #[test]
    fn wrong_root_is_rejected() {
        assert!(matches!(
            parse("<profile><key code=\"1\">x</key></profile>"),
            Err(ProfileError::InvalidRoot)
        ));
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(parse("<jsprogProfile><key code=").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn missing_prologue_and_epilogue_are_none() {
        let profile = parse("<jsprogProfile><key code=\"1\">x = 1</key></jsprogProfile>").unwrap();
        assert!(profile.prologue.is_none());
        assert!(profile.epilogue.is_none());
    }
}
