use crate::merge::Merger;
use ballast::event::Event;
use ballast::manager::Manager;
use lux::logging;
use lux::logging::Logger;
use std::sync::{Arc, Mutex, Weak};

/// Wires a shared merger core to the communication manager: packets become
/// handled requests with a reply on the same connection, closed connections
/// drop their volatile layers.
pub struct MergerService {
    core: Arc<Mutex<Merger>>,
    com: Weak<Manager>,
    log: Logger,
}

impl MergerService {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(com: &Arc<Manager>, log: L) -> MergerService {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        MergerService {
            core: Arc::new(Mutex::new(Merger::new(&log))),
            com: Arc::downgrade(com),
            log,
        }
    }

    /// Shared access to the merger state, mainly for inspection.
    pub fn core(&self) -> Arc<Mutex<Merger>> {
        Arc::clone(&self.core)
    }

    /// Register the event listener on the manager.
    pub fn attach(&self) {
        let manager = match self.com.upgrade() {
            Some(manager) => manager,
            None => return,
        };

        let core = Arc::clone(&self.core);
        let com = Weak::clone(&self.com);
        let log = self.log.new(logging::o!());

        manager.register_high_level_listener(move |event: &Event| {
            let manager = match com.upgrade() {
                Some(manager) => manager,
                None => return,
            };

            match event {
                Event::Packet(cid, doc) => {
                    // The universe is re-merged inside handle_request, before
                    // the reply exists.
                    let (reply, stop) = {
                        let mut core = core.lock().unwrap();
                        let reply = core.handle_request(doc, *cid);
                        (reply, core.take_stop_request())
                    };

                    if let Err(err) = manager.send(*cid, &reply) {
                        logging::warn!(log, "reply failed"; "cid" => *cid, "error" => %err);
                    }
                    if stop {
                        manager.stop();
                    }
                }
                Event::ConnectionClosed(cid) => {
                    core.lock().unwrap().connection_closed(*cid);
                }
                _ => (),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    fn connect_retry(path: &Path) -> UnixStream {
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(path) {
                return stream;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("could not connect to {:?}", path);
    }

    fn request(stream: &mut UnixStream, reader: &mut BufReader<UnixStream>, doc: Value) -> Value {
        stream.write_all(doc.to_string().as_bytes()).unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_end_to_end_volatile_cleanup_and_quit() {
        let path = std::env::temp_dir().join(format!("llmerger-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let com = Arc::new(Manager::new(None).unwrap());
        let service = MergerService::new(&com, None);
        service.attach();
        com.listen_unix(&path).unwrap();

        let worker = {
            let com = Arc::clone(&com);
            thread::spawn(move || com.main())
        };

        let mut client_x = connect_retry(&path);
        client_x
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader_x = BufReader::new(client_x.try_clone().unwrap());

        let reply = request(
            &mut client_x,
            &mut reader_x,
            json!({
                "id": "1",
                "request": "new layer",
                "layer": "7",
                "channels": [{"address": "1", "value": "255"}]
            }),
        );
        assert_eq!(reply, json!({"id": "1", "status": "ok"}));

        let mut client_y = connect_retry(&path);
        client_y
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader_y = BufReader::new(client_y.try_clone().unwrap());

        let reply = request(
            &mut client_y,
            &mut reader_y,
            json!({
                "id": "2",
                "request": "new layer",
                "layer": "8",
                "status": "persistent",
                "channels": [{"address": "2", "value": "127"}]
            }),
        );
        assert_eq!(reply, json!({"id": "2", "status": "ok"}));

        // Both layers are live while X is connected.
        let reply = request(&mut client_y, &mut reader_y, json!({"id": "3", "request": "output"}));
        assert_eq!(reply["output"], json!({"1": 255, "2": 127}));

        // X goes away; its volatile layer follows.
        drop(reader_x);
        drop(client_x);
        thread::sleep(Duration::from_millis(300));

        let reply = request(&mut client_y, &mut reader_y, json!({"id": "4", "request": "status"}));
        assert_eq!(reply["id"], json!("4"));
        let layers = reply["data"]["layers"].as_object().unwrap();
        assert!(layers.contains_key("8"));
        assert!(!layers.contains_key("7"));

        let reply = request(&mut client_y, &mut reader_y, json!({"id": "5", "request": "output"}));
        assert_eq!(reply["output"], json!({"2": 127}));

        // quit replies, then brings the whole loop down.
        let reply = request(&mut client_y, &mut reader_y, json!({"id": "6", "request": "quit"}));
        assert_eq!(reply, json!({"id": "6", "status": "ok"}));

        worker.join().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_requests_on_one_connection_stay_ordered() {
        let path = std::env::temp_dir().join(format!("llmerger-fifo-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let com = Arc::new(Manager::new(None).unwrap());
        let service = MergerService::new(&com, None);
        service.attach();
        com.listen_unix(&path).unwrap();

        let worker = {
            let com = Arc::clone(&com);
            thread::spawn(move || com.main())
        };

        let mut client = connect_retry(&path);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());

        // Two adjacent documents in a single write; replies come back in
        // request order.
        let batch = format!(
            "{}{}",
            json!({"id": "a", "request": "new layer", "layer": "1",
                   "channels": [{"address": 1, "value": 5}]}),
            json!({"id": "b", "request": "output"})
        );
        client.write_all(batch.as_bytes()).unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let first: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(first, json!({"id": "a", "status": "ok"}));

        line.clear();
        reader.read_line(&mut line).unwrap();
        let second: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(second["id"], json!("b"));
        assert_eq!(second["output"], json!({"1": 5}));

        com.stop();
        worker.join().unwrap();
    }
}
