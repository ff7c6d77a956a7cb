use ballast::support::Cid;
use hashbrown::HashMap;
use serde_json::Value;
use std::cmp::{self, Ordering};
use std::fmt;
use std::str::FromStr;

/// A layer's position in the stack, written in dotted notation of signed
/// integers (`1`, `2.1`, `-1.6.-3`).
///
/// Ordering compares components left to right; a strict prefix sorts below
/// the longer level, components of equal sign compare by magnitude, and
/// negative components sort above everything non-negative.
#[derive(Debug, Clone)]
pub struct Level {
    components: Vec<i64>,
    text: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LevelFormatError;

impl fmt::Display for LevelFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad level format")
    }
}

impl FromStr for Level {
    type Err = LevelFormatError;

    fn from_str(text: &str) -> Result<Level, LevelFormatError> {
        if text.is_empty() {
            return Err(LevelFormatError);
        }

        let mut components = Vec::new();
        for part in text.split('.') {
            let digits = part.strip_prefix('-').unwrap_or(part);
            if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
                return Err(LevelFormatError);
            }
            let component = part.parse::<i64>().map_err(|_| LevelFormatError)?;
            components.push(component);
        }

        Ok(Level {
            components,
            text: text.to_string(),
        })
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Level {
    fn eq(&self, other: &Level) -> bool {
        self.components == other.components
    }
}

impl Eq for Level {}

impl Ord for Level {
    fn cmp(&self, other: &Level) -> Ordering {
        let mut idx = 0;
        loop {
            match (self.components.get(idx), other.components.get(idx)) {
                (None, None) => return Ordering::Equal,
                // A strict prefix sorts below the longer path.
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(&left), Some(&right)) => match component_cmp(left, right) {
                    Ordering::Equal => idx += 1,
                    ordering => return ordering,
                },
            }
        }
    }
}

impl PartialOrd for Level {
    fn partial_cmp(&self, other: &Level) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn component_cmp(left: i64, right: i64) -> Ordering {
    if left == right {
        Ordering::Equal
    } else if (left < 0) == (right < 0) {
        left.unsigned_abs().cmp(&right.unsigned_abs())
    } else if left < 0 {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// How a channel combines with the partial universe below it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MixType {
    /// Linear cross-fade weight in [0,1]: 0 keeps the value below, 1 takes
    /// this layer's value.
    Weight(f64),
    Min,
    Max,
}

impl MixType {
    /// Parse the wire representation: a number, a numeric string, or the
    /// symbols `min`/`max`.
    pub fn from_value(value: &Value) -> Result<MixType, String> {
        match value {
            Value::Number(number) => number
                .as_f64()
                .map(MixType::Weight)
                .ok_or_else(|| format!("{}: unknown mix type", number)),
            Value::String(text) => match text.as_str() {
                "min" => Ok(MixType::Min),
                "max" => Ok(MixType::Max),
                other => other
                    .trim()
                    .parse::<f64>()
                    .map(MixType::Weight)
                    .map_err(|_| format!("{}: unknown mix type", other)),
            },
            other => Err(format!("{}: unknown mix type", other)),
        }
    }

    pub fn apply(&self, old: u64, value: u64) -> u64 {
        match *self {
            MixType::Weight(weight) => {
                ((1.0 - weight) * old as f64 + weight * value as f64 + 0.5) as u64
            }
            MixType::Min => cmp::min(old, value),
            MixType::Max => cmp::max(old, value),
        }
    }

    pub fn to_value(&self) -> Value {
        match *self {
            MixType::Weight(weight) => Value::from(weight),
            MixType::Min => Value::from("min"),
            MixType::Max => Value::from("max"),
        }
    }
}

/// One channel contribution: a value spanning `nb_chan` consecutive DMX
/// addresses in big-endian byte order, and the operator mixing it in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelValue {
    pub value: u64,
    pub nb_chan: usize,
    pub mix: MixType,
}

impl ChannelValue {
    pub fn new(value: u64, mix: MixType, nb_chan: usize) -> ChannelValue {
        ChannelValue {
            value: value & Self::mask(nb_chan),
            nb_chan,
            mix,
        }
    }

    /// Bit mask for a value spanning `nb_chan` bytes.
    pub fn mask(nb_chan: usize) -> u64 {
        if nb_chan >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * nb_chan)) - 1
        }
    }

    pub fn set_value(&mut self, value: u64) {
        self.value = value & Self::mask(self.nb_chan);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LayerStatus {
    /// Removed automatically when the owning connection closes.
    Volatile,
    /// Survives disconnections.
    Persistent,
}

/// A named set of channel contributions. Layers are merged low-to-high into
/// the universe.
#[derive(Debug, Clone)]
pub struct Layer {
    pub level: Level,
    pub status: LayerStatus,
    pub cid: Cid,
    pub channels: HashMap<u32, ChannelValue>,
}

impl Layer {
    pub fn new(level: Level, status: LayerStatus, cid: Cid) -> Layer {
        Layer {
            level,
            status,
            cid,
            channels: HashMap::new(),
        }
    }

    /// Add a channel, replacing any existing entry at the same address.
    pub fn add_channel(&mut self, address: u32, channel: ChannelValue) {
        self.channels.insert(address, channel);
    }

    pub fn update_channel(
        &mut self,
        address: u32,
        value: Option<u64>,
        mix: Option<MixType>,
    ) -> Result<(), String> {
        let channel = self
            .channels
            .get_mut(&address)
            .ok_or_else(|| format!("unknown channel: {}", address))?;
        if let Some(value) = value {
            channel.set_value(value);
        }
        if let Some(mix) = mix {
            channel.mix = mix;
        }
        Ok(())
    }

    pub fn del_channel(&mut self, address: u32) -> Result<(), String> {
        self.channels
            .remove(&address)
            .map(|_| ())
            .ok_or_else(|| format!("unknown channel: {}", address))
    }
}
