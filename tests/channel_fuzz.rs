use pybridge::dap::channel::{Handlers, JsonMessageChannel};
use pybridge::dap::transport::FramedTransport;
use rand::Rng;
use serde_json::{json, Value};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MESSAGES_PER_SIDE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
enum Traffic {
    Request(String, Value),
    Event(String, Value),
}

type Log = Arc<Mutex<Vec<Traffic>>>;

fn endpoint(name: &str, stream: TcpStream, log: Log) -> JsonMessageChannel {
    let requests = log.clone();
    let handlers = Handlers::new()
        .on_any_request(move |ctx| {
            requests.lock().unwrap().push(Traffic::Request(
                ctx.command().to_string(),
                ctx.arguments().clone(),
            ));
            Ok(Some(json!({ "echo": ctx.arguments() })))
        })
        .on_any_event(move |_, event, body| {
            log.lock().unwrap().push(Traffic::Event(
                event.to_string(),
                body.cloned().unwrap_or(Value::Null),
            ));
        });
    let transport = FramedTransport::from_socket(stream).unwrap();
    JsonMessageChannel::new(name, Arc::new(transport), handlers)
}

fn random_traffic(rng: &mut impl Rng) -> Vec<Traffic> {
    (0..MESSAGES_PER_SIDE)
        .map(|i| {
            let payload = json!({
                "n": i,
                "value": rng.gen_range(-1000..1000),
                "text": "x".repeat(rng.gen_range(0..64)),
            });
            if rng.gen_bool(0.5) {
                Traffic::Request(format!("cmd{}", rng.gen_range(0..10)), payload)
            } else {
                Traffic::Event(format!("evt{}", rng.gen_range(0..10)), payload)
            }
        })
        .collect()
}

fn send_all(channel: JsonMessageChannel, traffic: Vec<Traffic>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut pending = vec![];
        for message in traffic {
            match message {
                Traffic::Request(command, arguments) => {
                    let request = channel
                        .send_request(&command, Some(arguments.clone()))
                        .unwrap();
                    pending.push((request, arguments));
                }
                Traffic::Event(event, body) => channel.send_event(&event, Some(body)).unwrap(),
            }
        }
        for (request, arguments) in pending {
            let response = request
                .wait_for_response_timeout(Duration::from_secs(10))
                .expect("response");
            assert_eq!(response.body(), Some(&json!({ "echo": arguments })));
        }
    })
}

fn wait_for(log: &Log, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while log.lock().unwrap().len() < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_bidirectional_random_traffic() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server_stream, _) = listener.accept().unwrap();

    let server_log = Log::default();
    let client_log = Log::default();
    let server = endpoint("server", server_stream, server_log.clone());
    let client = endpoint("client", client_stream, client_log.clone());
    server.start().unwrap();
    client.start().unwrap();

    let mut rng = rand::thread_rng();
    let from_server = random_traffic(&mut rng);
    let from_client = random_traffic(&mut rng);

    let server_sender = send_all(server.clone(), from_server.clone());
    let client_sender = send_all(client.clone(), from_client.clone());
    server_sender.join().unwrap();
    client_sender.join().unwrap();

    wait_for(&client_log, from_server.len());
    wait_for(&server_log, from_client.len());
    assert_eq!(*client_log.lock().unwrap(), from_server);
    assert_eq!(*server_log.lock().unwrap(), from_client);

    client.close();
    server.wait().unwrap();
    assert!(server.is_closed());
}
