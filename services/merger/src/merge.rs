use crate::dispatch::RequestHandler;
use crate::layer::{ChannelValue, Layer, LayerStatus, Level};
use ballast::support::Cid;
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use lux::logging;
use lux::logging::Logger;
use serde_json::{Map, Value};
use std::mem;

/// The DMX universe: address → byte, with unassigned addresses reading 0.
/// Only addresses some layer has touched are stored and serialised.
#[derive(Debug, Clone, PartialEq)]
pub struct Universe {
    cells: HashMap<u32, u8>,
}

impl Universe {
    pub fn new() -> Universe {
        Universe { cells: HashMap::new() }
    }

    pub fn get(&self, address: u32) -> u8 {
        self.cells.get(&address).copied().unwrap_or(0)
    }

    pub fn set(&mut self, address: u32, value: u8) {
        self.cells.insert(address, value);
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        for (&address, &value) in &self.cells {
            object.insert(address.to_string(), Value::from(value));
        }
        Value::Object(object)
    }
}

/// Folds an ordered set of layers into the universe and serves the request
/// protocol against that state.
pub struct Merger {
    layers: Vec<Layer>,
    universe: Universe,
    pub(crate) handlers: HashMap<&'static str, RequestHandler>,
    stop_requested: bool,
    pub(crate) log: Logger,
}

impl Merger {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Merger {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        Merger {
            layers: Vec::new(),
            universe: Universe::new(),
            handlers: crate::dispatch::handler_table(),
            stop_requested: false,
            log,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    /// Insert a layer, replacing any existing layer at the same level.
    pub fn add_layer(&mut self, layer: Layer) {
        self.del_layer(&layer.level);
        self.layers.push(layer);
    }

    /// Remove a layer; silent when the level is unknown.
    pub fn del_layer(&mut self, level: &Level) {
        if let Some(pos) = self.layers.iter().position(|layer| layer.level == *level) {
            self.layers.remove(pos);
        }
    }

    pub fn layer_mut(&mut self, level: &Level) -> Result<&mut Layer, String> {
        self.layers
            .iter_mut()
            .find(|layer| layer.level == *level)
            .ok_or_else(|| format!("unknown layer: {}", level))
    }

    /// Recompute the whole universe from the current layer set, lowest
    /// level first.
    pub fn merge(&mut self) {
        self.universe.clear();
        self.layers.sort_by(|a, b| a.level.cmp(&b.level));

        for layer in &self.layers {
            for (&address, channel) in &layer.channels {
                merge_channel(&mut self.universe, address, channel);
            }
        }

        logging::debug!(self.log, "merged"; "layers" => self.layers.len());
    }

    /// Drop the volatile layers owned by a closed connection.
    pub fn connection_closed(&mut self, cid: Cid) {
        let before = self.layers.len();
        self.layers
            .retain(|layer| layer.status == LayerStatus::Persistent || layer.cid != cid);

        if self.layers.len() != before {
            logging::debug!(self.log, "volatile layers dropped";
                            "cid" => cid, "count" => before - self.layers.len());
            self.merge();
        }
    }

    pub(crate) fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// True once, after a `quit` request was handled.
    pub fn take_stop_request(&mut self) -> bool {
        mem::replace(&mut self.stop_requested, false)
    }
}

/// Mix one channel into the universe: read the `nb_chan`-byte big-endian
/// span, apply the operator, write the span back.
fn merge_channel(universe: &mut Universe, address: u32, channel: &ChannelValue) {
    let nb_chan = channel.nb_chan;
    let mut bytes = [0u8; 8];

    for offset in 0..nb_chan {
        bytes[offset] = universe.get(address + offset as u32);
    }
    let old = BigEndian::read_uint(&bytes[..nb_chan], nb_chan);

    let mixed = channel.mix.apply(old, channel.value) & ChannelValue::mask(nb_chan);

    BigEndian::write_uint(&mut bytes[..nb_chan], mixed, nb_chan);
    for offset in 0..nb_chan {
        universe.set(address + offset as u32, bytes[offset]);
    }
}
