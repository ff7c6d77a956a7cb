use crate::layer::{ChannelValue, Layer, LayerStatus, Level, MixType};
use crate::merge::Merger;
use ballast::support::Cid;
use hashbrown::HashMap;
use lux::logging;
use serde_json::{json, Map, Value};
use std::fmt;

type JsonMap = Map<String, Value>;

/// Tagged failure of a request handler, formatted into the reply's `error`
/// field.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    MissingKey(String),
    UnknownRequest(String),
    Value(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::MissingKey(key) => write!(f, "Protocol error, missing key: {}", key),
            RequestError::UnknownRequest(name) => {
                write!(f, "Protocol error, unknown request: {}", name)
            }
            RequestError::Value(detail) => write!(f, "Value error: {}", detail),
        }
    }
}

type Handler = fn(&mut Merger, &JsonMap, Cid, &mut JsonMap) -> Result<(), RequestError>;

/// One dispatch-table entry. Mutating requests re-merge the universe before
/// the reply is produced.
#[derive(Copy, Clone)]
pub struct RequestHandler {
    run: Handler,
    mutating: bool,
}

/// The request-name → handler mapping, built once per merger.
pub fn handler_table() -> HashMap<&'static str, RequestHandler> {
    let mut table: HashMap<&'static str, RequestHandler> = HashMap::new();

    table.insert("new layer", RequestHandler { run: new_layer, mutating: true });
    table.insert("remove layer", RequestHandler { run: remove_layer, mutating: true });
    table.insert("new channels", RequestHandler { run: new_channels, mutating: true });
    table.insert("update channels", RequestHandler { run: update_channels, mutating: true });
    table.insert("remove channels", RequestHandler { run: remove_channels, mutating: true });
    table.insert("status", RequestHandler { run: status, mutating: false });
    table.insert("output", RequestHandler { run: output, mutating: false });
    table.insert("quit", RequestHandler { run: quit, mutating: false });

    table
}

impl Merger {
    /// Handle one request document and produce the reply document. The
    /// request `id` is echoed; errors become `{"id", "error"}` replies.
    pub fn handle_request(&mut self, request: &Value, cid: Cid) -> Value {
        let object = match request.as_object() {
            Some(object) => object,
            None => return json!({"error": "Protocol error, missing request id"}),
        };

        let rid = match object.get("id") {
            Some(rid) => rid.clone(),
            None => return json!({"error": "Protocol error, missing request id"}),
        };

        let name = match object.get("request") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => return error_reply(&rid, &RequestError::UnknownRequest(other.to_string())),
            None => return error_reply(&rid, &RequestError::MissingKey("request".to_string())),
        };

        logging::debug!(self.log, "request"; "request" => name.as_str(), "cid" => cid);

        let handler = match self.handlers.get(name.as_str()) {
            Some(handler) => *handler,
            None => return error_reply(&rid, &RequestError::UnknownRequest(name)),
        };

        let mut reply = JsonMap::new();
        reply.insert("id".to_string(), rid.clone());

        match (handler.run)(self, object, cid, &mut reply) {
            Ok(()) => {
                if handler.mutating {
                    self.merge();
                }
                Value::Object(reply)
            }
            Err(err) => error_reply(&rid, &err),
        }
    }
}

fn error_reply(rid: &Value, err: &RequestError) -> Value {
    json!({"id": rid, "error": err.to_string()})
}

fn new_layer(merger: &mut Merger, request: &JsonMap, cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let level = get_level(request)?;
    let status = match request.get("status").and_then(Value::as_str) {
        Some("persistent") => LayerStatus::Persistent,
        _ => LayerStatus::Volatile,
    };
    let channels = parse_channels(request)?;

    let mut layer = Layer::new(level, status, cid);
    for (address, channel) in channels {
        layer.add_channel(address, channel);
    }
    merger.add_layer(layer);

    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn remove_layer(merger: &mut Merger, request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let raw = request
        .get("layer")
        .ok_or_else(|| RequestError::MissingKey("layer".to_string()))?;

    // An unknown or unparseable level is a silent no-op.
    if let Some(text) = raw.as_str() {
        if let Ok(level) = text.parse::<Level>() {
            merger.del_layer(&level);
        }
    }

    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn new_channels(merger: &mut Merger, request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let level = get_level(request)?;
    let channels = parse_channels(request)?;

    let layer = merger.layer_mut(&level).map_err(RequestError::Value)?;
    for (address, channel) in channels {
        layer.add_channel(address, channel);
    }

    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn update_channels(merger: &mut Merger, request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let level = get_level(request)?;

    let mut updates = Vec::new();
    for entry in channel_entries(request)? {
        let address = get_address(entry)?;
        let value = match entry.get("value") {
            Some(raw) => Some(as_integer(raw, "value")? as u64),
            None => None,
        };
        let mix = match entry.get("mixType") {
            Some(raw) => Some(MixType::from_value(raw).map_err(RequestError::Value)?),
            None => None,
        };
        updates.push((address, value, mix));
    }

    let layer = merger.layer_mut(&level).map_err(RequestError::Value)?;
    for (address, value, mix) in updates {
        layer
            .update_channel(address, value, mix)
            .map_err(RequestError::Value)?;
    }

    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn remove_channels(merger: &mut Merger, request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let level = get_level(request)?;

    let mut addresses = Vec::new();
    for entry in channel_entries(request)? {
        addresses.push(get_address(entry)?);
    }

    let layer = merger.layer_mut(&level).map_err(RequestError::Value)?;
    for address in addresses {
        layer.del_channel(address).map_err(RequestError::Value)?;
    }

    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn status(merger: &mut Merger, _request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    let mut layers = JsonMap::new();
    for layer in merger.layers() {
        let mut channels = JsonMap::new();
        for (&address, channel) in &layer.channels {
            channels.insert(
                address.to_string(),
                json!({
                    "value": channel.value,
                    "mixType": channel.mix.to_value(),
                    "nbChan": channel.nb_chan,
                }),
            );
        }
        layers.insert(layer.level.to_string(), Value::Object(channels));
    }

    reply.insert("status".to_string(), json!("ok"));
    reply.insert("data".to_string(), json!({ "layers": layers }));
    Ok(())
}

fn output(merger: &mut Merger, _request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    reply.insert("status".to_string(), json!("ok"));
    reply.insert("output".to_string(), merger.universe().to_value());
    Ok(())
}

fn quit(merger: &mut Merger, _request: &JsonMap, _cid: Cid, reply: &mut JsonMap) -> Result<(), RequestError> {
    merger.request_stop();
    reply.insert("status".to_string(), json!("ok"));
    Ok(())
}

fn get_level(request: &JsonMap) -> Result<Level, RequestError> {
    let raw = request
        .get("layer")
        .ok_or_else(|| RequestError::MissingKey("layer".to_string()))?;
    match raw.as_str() {
        Some(text) => text
            .parse()
            .map_err(|_| RequestError::Value("bad level format".to_string())),
        None => Err(RequestError::Value("bad level format".to_string())),
    }
}

/// The `channels` list, defaulting to empty when absent.
fn channel_entries(request: &JsonMap) -> Result<Vec<&JsonMap>, RequestError> {
    match request.get("channels") {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .ok_or_else(|| RequestError::Value(format!("invalid channel entry: {}", item)))
            })
            .collect(),
        Some(other) => Err(RequestError::Value(format!(
            "invalid channels list: {}",
            other
        ))),
    }
}

fn parse_channels(request: &JsonMap) -> Result<Vec<(u32, ChannelValue)>, RequestError> {
    let mut channels = Vec::new();
    for entry in channel_entries(request)? {
        channels.push(parse_channel(entry)?);
    }
    Ok(channels)
}

fn parse_channel(entry: &JsonMap) -> Result<(u32, ChannelValue), RequestError> {
    let address = get_address(entry)?;

    let mix = match entry.get("mixType") {
        Some(raw) => MixType::from_value(raw).map_err(RequestError::Value)?,
        None => MixType::Weight(1.0),
    };

    let nb_chan = match entry.get("nbChan") {
        Some(raw) => {
            let count = as_integer(raw, "nbChan")?;
            if count < 1 || count > 8 {
                return Err(value_error("nbChan", raw));
            }
            count as usize
        }
        None => 1,
    };

    let raw_value = entry
        .get("value")
        .ok_or_else(|| RequestError::MissingKey("value".to_string()))?;
    let value = as_integer(raw_value, "value")? as u64;

    Ok((address, ChannelValue::new(value, mix, nb_chan)))
}

fn get_address(entry: &JsonMap) -> Result<u32, RequestError> {
    let raw = entry
        .get("address")
        .ok_or_else(|| RequestError::MissingKey("address".to_string()))?;
    let address = as_integer(raw, "address")?;
    if address < 0 || address > u32::MAX as i64 {
        return Err(value_error("address", raw));
    }
    Ok(address as u32)
}

/// Integer fields arrive as JSON numbers or numeric strings.
fn as_integer(raw: &Value, what: &str) -> Result<i64, RequestError> {
    match raw {
        Value::Number(number) => number.as_i64().ok_or_else(|| value_error(what, raw)),
        Value::String(text) => text.trim().parse().map_err(|_| value_error(what, raw)),
        _ => Err(value_error(what, raw)),
    }
}

fn value_error(what: &str, raw: &Value) -> RequestError {
    RequestError::Value(format!("invalid {}: {}", what, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MixType;

    fn merger() -> Merger {
        Merger::new(None)
    }

    fn ok(id: &str) -> Value {
        json!({"id": id, "status": "ok"})
    }

    #[test]
    fn test_missing_request_id() {
        let mut m = merger();

        let reply = m.handle_request(&json!({"request": "status"}), 1);
        assert_eq!(reply, json!({"error": "Protocol error, missing request id"}));

        // Non-object documents have no id either.
        let reply = m.handle_request(&json!([1, 2, 3]), 1);
        assert_eq!(reply, json!({"error": "Protocol error, missing request id"}));
    }

    #[test]
    fn test_missing_request_key() {
        let mut m = merger();
        let reply = m.handle_request(&json!({"id": "1"}), 1);
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Protocol error, missing key: request"})
        );
    }

    #[test]
    fn test_unknown_request() {
        let mut m = merger();
        let reply = m.handle_request(&json!({"id": "1", "request": "dance"}), 1);
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Protocol error, unknown request: dance"})
        );
    }

    #[test]
    fn test_missing_layer_key() {
        let mut m = merger();
        let reply = m.handle_request(&json!({"id": "1", "request": "new channels"}), 1);
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Protocol error, missing key: layer"})
        );
    }

    #[test]
    fn test_bad_level_format() {
        let mut m = merger();
        let reply = m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1..2"}),
            1,
        );
        assert_eq!(reply, json!({"id": "1", "error": "Value error: bad level format"}));
    }

    #[test]
    fn test_unknown_layer() {
        let mut m = merger();
        let reply = m.handle_request(
            &json!({"id": "1", "request": "new channels", "layer": "9",
                    "channels": [{"address": 1, "value": 1}]}),
            1,
        );
        assert_eq!(reply, json!({"id": "1", "error": "Value error: unknown layer: 9"}));
    }

    #[test]
    fn test_new_layer_and_output() {
        let mut m = merger();

        // String-typed fields arrive from older clients.
        let reply = m.handle_request(
            &json!({
                "id": "1",
                "request": "new layer",
                "layer": "1",
                "channels": [
                    {"address": "1", "value": "255"},
                    {"address": "2", "value": "127"}
                ]
            }),
            1,
        );
        assert_eq!(reply, ok("1"));

        let reply = m.handle_request(&json!({"id": "2", "request": "output"}), 1);
        assert_eq!(reply["id"], json!("2"));
        assert_eq!(reply["status"], json!("ok"));
        assert_eq!(reply["output"], json!({"1": 255, "2": 127}));
    }

    #[test]
    fn test_full_mix_over_the_protocol() {
        let mut m = merger();

        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 2, "value": 1},
                {"address": 3, "value": 255},
                {"address": 4, "value": 127}
            ]}),
            1,
        );
        m.handle_request(
            &json!({"id": "2", "request": "new layer", "layer": "2", "channels": [
                {"address": 3, "value": 0, "mixType": 0.5},
                {"address": 4, "value": 255, "mixType": "max"},
                {"address": 5, "value": 255, "mixType": "min"}
            ]}),
            1,
        );
        m.handle_request(
            &json!({"id": "3", "request": "new layer", "layer": "3", "channels": [
                {"address": 2, "value": 255, "mixType": 0.3}
            ]}),
            1,
        );
        m.handle_request(
            &json!({"id": "4", "request": "new layer", "layer": "4", "channels": [
                {"address": 2, "value": 127, "mixType": 0.6}
            ]}),
            1,
        );

        let reply = m.handle_request(&json!({"id": "5", "request": "output"}), 1);
        assert_eq!(reply["output"], json!({"2": 107, "3": 128, "4": 255, "5": 0}));
    }

    #[test]
    fn test_value_masking_on_create() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 0x1FFFF, "nbChan": 2}
            ]}),
            1,
        );

        assert_eq!(m.layers()[0].channels[&1].value, 0xFFFF);
    }

    #[test]
    fn test_update_masks_with_existing_nb_chan() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 10}
            ]}),
            1,
        );

        let reply = m.handle_request(
            &json!({"id": "2", "request": "update channels", "layer": "1", "channels": [
                {"address": 1, "value": 300}
            ]}),
            1,
        );
        assert_eq!(reply, ok("2"));
        assert_eq!(m.layers()[0].channels[&1].value, 44);
    }

    #[test]
    fn test_update_mix_type_to_symbol() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 10}
            ]}),
            1,
        );

        let reply = m.handle_request(
            &json!({"id": "2", "request": "update channels", "layer": "1", "channels": [
                {"address": 1, "mixType": "min"}
            ]}),
            1,
        );
        assert_eq!(reply, ok("2"));
        assert_eq!(m.layers()[0].channels[&1].mix, MixType::Min);
        // The value is untouched.
        assert_eq!(m.layers()[0].channels[&1].value, 10);
    }

    #[test]
    fn test_unknown_mix_type() {
        let mut m = merger();
        let reply = m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 10, "mixType": "tango"}
            ]}),
            1,
        );
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Value error: tango: unknown mix type"})
        );
        // The failed request left nothing behind.
        assert!(m.layers().is_empty());
    }

    #[test]
    fn test_remove_channels_and_layers() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 255},
                {"address": 2, "value": 127}
            ]}),
            1,
        );

        let reply = m.handle_request(
            &json!({"id": "2", "request": "remove channels", "layer": "1", "channels": [
                {"address": 1}
            ]}),
            1,
        );
        assert_eq!(reply, ok("2"));

        let reply = m.handle_request(&json!({"id": "3", "request": "output"}), 1);
        assert_eq!(reply["output"], json!({"2": 127}));

        let reply = m.handle_request(&json!({"id": "4", "request": "remove layer", "layer": "1"}), 1);
        assert_eq!(reply, ok("4"));
        assert!(m.layers().is_empty());

        // Removing an absent layer stays silent.
        let reply = m.handle_request(&json!({"id": "5", "request": "remove layer", "layer": "1"}), 1);
        assert_eq!(reply, ok("5"));
    }

    #[test]
    fn test_remove_unknown_channel() {
        let mut m = merger();
        m.handle_request(&json!({"id": "1", "request": "new layer", "layer": "1"}), 1);

        let reply = m.handle_request(
            &json!({"id": "2", "request": "remove channels", "layer": "1", "channels": [
                {"address": 9}
            ]}),
            1,
        );
        assert_eq!(reply, json!({"id": "2", "error": "Value error: unknown channel: 9"}));
    }

    #[test]
    fn test_status_snapshot() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "2.1", "status": "persistent",
                    "channels": [{"address": 5, "value": 9, "mixType": "max", "nbChan": 2}]}),
            7,
        );

        let reply = m.handle_request(&json!({"id": "2", "request": "status"}), 7);
        assert_eq!(reply["id"], json!("2"));
        assert_eq!(
            reply["data"]["layers"],
            json!({"2.1": {"5": {"value": 9, "mixType": "max", "nbChan": 2}}})
        );
    }

    #[test]
    fn test_reply_id_echo_types() {
        let mut m = merger();
        // Non-string ids are echoed verbatim.
        let reply = m.handle_request(&json!({"id": 42, "request": "status"}), 1);
        assert_eq!(reply["id"], json!(42));
    }

    #[test]
    fn test_quit_sets_stop_flag() {
        let mut m = merger();
        let reply = m.handle_request(&json!({"id": "1", "request": "quit"}), 1);
        assert_eq!(reply, ok("1"));
        assert!(m.take_stop_request());
        assert!(!m.take_stop_request());
    }

    #[test]
    fn test_replacing_layer_drops_old_channels() {
        let mut m = merger();
        m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 255}
            ]}),
            1,
        );
        m.handle_request(
            &json!({"id": "2", "request": "new layer", "layer": "1", "channels": [
                {"address": 2, "value": 9}
            ]}),
            1,
        );

        let reply = m.handle_request(&json!({"id": "3", "request": "output"}), 1);
        assert_eq!(reply["output"], json!({"2": 9}));
    }

    #[test]
    fn test_invalid_numbers() {
        let mut m = merger();
        let reply = m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": "x", "value": 1}
            ]}),
            1,
        );
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Value error: invalid address: \"x\""})
        );

        let reply = m.handle_request(
            &json!({"id": "2", "request": "new layer", "layer": "1", "channels": [
                {"address": 1, "value": 1, "nbChan": 0}
            ]}),
            1,
        );
        assert_eq!(reply, json!({"id": "2", "error": "Value error: invalid nbChan: 0"}));
    }

    #[test]
    fn test_missing_channel_value() {
        let mut m = merger();
        let reply = m.handle_request(
            &json!({"id": "1", "request": "new layer", "layer": "1", "channels": [
                {"address": 1}
            ]}),
            1,
        );
        assert_eq!(
            reply,
            json!({"id": "1", "error": "Protocol error, missing key: value"})
        );
    }
}
