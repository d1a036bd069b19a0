use std::fmt;

/// A signal that the user is still present.
///
/// Any single occurrence pushes the idle deadline out by the full timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    PointerDown,
    PointerMove,
    KeyDown,
    Scroll,
    TouchStart,
    /// A successful authenticated API call.
    ApiCall,
    /// An explicit reset requested by application code.
    Manual,
}

impl ActivityKind {
    /// Host input events that count as activity.
    pub const INPUT_EVENTS: [ActivityKind; 5] = [
        ActivityKind::PointerDown,
        ActivityKind::KeyDown,
        ActivityKind::Scroll,
        ActivityKind::TouchStart,
        ActivityKind::PointerMove,
    ];

    /// Map a host event name (e.g. `"keydown"`) to an activity kind.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "pointerdown" | "mousedown" => ActivityKind::PointerDown,
            "pointermove" | "mousemove" => ActivityKind::PointerMove,
            "keydown" => ActivityKind::KeyDown,
            "scroll" => ActivityKind::Scroll,
            "touchstart" => ActivityKind::TouchStart,
            _ => return None,
        };
        Some(kind)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ActivityKind::PointerDown => "pointerdown",
            ActivityKind::PointerMove => "pointermove",
            ActivityKind::KeyDown => "keydown",
            ActivityKind::Scroll => "scroll",
            ActivityKind::TouchStart => "touchstart",
            ActivityKind::ApiCall => "api-call",
            ActivityKind::Manual => "manual",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}
