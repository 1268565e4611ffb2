//! Rover frame codec.
//!
//! The firmware reads whatever bytes arrived in one burst as a single buffer:
//! `%`, optional decimal speed digits, then one command letter as the last
//! character. Unknown letters and buffers not starting with `%` stop both
//! motors. Frames built here are always well formed; [`interpret`] models the
//! firmware side and drives the simulated rover.

use std::fmt;
use std::str::FromStr;

pub const FRAME_START: char = '%';
pub const MAX_SPEED_PCT: u8 = 100;

/// Line the firmware prints after a speed-only frame.
const SPEED_CHATTER_PREFIX: &str = "Speed updated to:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Forward => "forward",
            Intent::Backward => "backward",
            Intent::Left => "left",
            Intent::Right => "right",
            Intent::Stop => "stop",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction '{0}'")]
pub struct UnknownIntent(pub String);

impl FromStr for Intent {
    type Err = UnknownIntent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "front" => Ok(Intent::Forward),
            "backward" | "back" => Ok(Intent::Backward),
            "left" => Ok(Intent::Left),
            "right" => Ok(Intent::Right),
            "stop" => Ok(Intent::Stop),
            _ => Err(UnknownIntent(s.to_string())),
        }
    }
}

/// Command letter carried as the last byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `-`: update speed, no motion.
    Speed,
    Left,
    Right,
    Forward,
    Backward,
    /// `X`: not a command letter, so the firmware stops both motors.
    Halt,
}

impl Command {
    pub fn letter(self) -> char {
        match self {
            Command::Speed => '-',
            Command::Left => 'L',
            Command::Right => 'R',
            Command::Forward => 'W',
            Command::Backward => 'S',
            Command::Halt => 'X',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    speed: Option<u8>,
    command: Command,
}

impl Frame {
    /// Motion frames carry the speed so the rover never moves at a stale one.
    pub fn motion(intent: Intent, speed_pct: u8) -> Self {
        let command = match intent {
            Intent::Forward => Command::Forward,
            Intent::Backward => Command::Backward,
            Intent::Left => Command::Left,
            Intent::Right => Command::Right,
            Intent::Stop => return Self::halt(),
        };
        Self { speed: Some(speed_pct.min(MAX_SPEED_PCT)), command }
    }

    pub fn speed(speed_pct: u8) -> Self {
        Self { speed: Some(speed_pct.min(MAX_SPEED_PCT)), command: Command::Speed }
    }

    pub fn halt() -> Self {
        Self { speed: None, command: Command::Halt }
    }

    pub fn speed_pct(&self) -> Option<u8> {
        self.speed
    }

    pub fn intent(&self) -> Option<Intent> {
        match self.command {
            Command::Speed => None,
            Command::Left => Some(Intent::Left),
            Command::Right => Some(Intent::Right),
            Command::Forward => Some(Intent::Forward),
            Command::Backward => Some(Intent::Backward),
            Command::Halt => Some(Intent::Stop),
        }
    }

    pub fn encode(&self) -> String {
        match self.speed {
            Some(s) => format!("{}{}{}", FRAME_START, s, self.command.letter()),
            None => format!("{}{}", FRAME_START, self.command.letter()),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// What the firmware does with one received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SpeedOnly,
    Turn(Intent),
    Drive(Intent),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreted {
    /// New speed latched by the firmware, if the buffer carried digits.
    pub speed: Option<i32>,
    pub action: Action,
}

/// Mirror of the sketch's parser.
pub fn interpret(buf: &str) -> Interpreted {
    let bytes = buf.as_bytes();
    if bytes.first() != Some(&b'%') {
        return Interpreted { speed: None, action: Action::Stop };
    }

    let (speed, cmd) = if bytes.len() > 2 && bytes[1].is_ascii_digit() {
        let digits = &bytes[1..bytes.len() - 1];
        (Some(leading_int(digits)), bytes[bytes.len() - 1])
    } else {
        (None, bytes.get(1).copied().unwrap_or(0))
    };

    let action = match cmd {
        b'+' | b'-' => Action::SpeedOnly,
        b'L' => Action::Turn(Intent::Left),
        b'R' => Action::Turn(Intent::Right),
        b'W' => Action::Drive(Intent::Forward),
        b'S' => Action::Drive(Intent::Backward),
        _ => Action::Stop,
    };
    Interpreted { speed, action }
}

// Arduino String::toInt: leading digits, 0 when there are none.
fn leading_int(digits: &[u8]) -> i32 {
    digits
        .iter()
        .copied()
        .take_while(|b| b.is_ascii_digit())
        .fold(0i32, |acc, b| acc.saturating_mul(10).saturating_add((b - b'0') as i32))
}

/// Classification of one line read back from the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Echo {
    Match,
    Chatter,
    Garbled(String),
}

pub fn classify_echo(frame: &Frame, line: &str) -> Echo {
    let line = line.trim();
    if line.is_empty() || line.starts_with(SPEED_CHATTER_PREFIX) {
        return Echo::Chatter;
    }
    if line == frame.encode() {
        Echo::Match
    } else {
        Echo::Garbled(line.to_string())
    }
}
