use std::process;

use anyhow::{anyhow, Result};
use log::warn;
use structopt::StructOpt;

use mqtt_client::{Client, EventHandler};
use mqtt_client::codec::{ConnectReturnCode, PacketId, ProtocolVersion, QoS, SubAckReturnCode};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sub",
    about = "a simple mqtt client that subscribes to topics and prints all messages it receives"
)]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// The id to use for this client. Defaults to libmqtt/ appended with
    /// the process id and hostname.
    #[structopt(short, long)]
    id: Option<String>,

    /// Keep alive in seconds for this client.
    #[structopt(short, long, default_value = "30")]
    keep_alive: u16,

    /// Disable 'clean session' (store subscription and pending messages
    /// when the client disconnects).
    #[structopt(short = "c", long)]
    no_clean_session: bool,

    /// The version of the MQTT protocol to use when connecting.
    /// Can be mqttv31 or mqttv311.
    #[structopt(short = "V", long, default_value = "mqttv311", parse(try_from_str = parse_protocol_version))]
    protocol_version: ProtocolVersion,

    /// Provide a username.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// Quality of service level to use for the subscription.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,

    /// Disconnect and exit after receiving this many messages.
    #[structopt(short = "C", long)]
    count: Option<usize>,

    /// The topic on which to publish the client Will.
    #[structopt(long)]
    will_topic: Option<String>,

    /// Payload for the client Will, which is sent by the broker in case of
    /// unexpected disconnection.
    #[structopt(long)]
    will_payload: Option<String>,

    /// QoS level for the client Will.
    #[structopt(long, default_value = "0", parse(try_from_str = parse_qos))]
    will_qos: QoS,

    /// If given, make the client Will retained.
    #[structopt(long)]
    will_retain: bool,

    /// Print received messages as "topic payload".
    #[structopt(short, long)]
    verbose: bool,

    /// The MQTT topic to subscribe to. May be repeated multiple times.
    #[structopt(short, long, required = true)]
    topic: Vec<String>,
}

fn parse_protocol_version(s: &str) -> Result<ProtocolVersion> {
    match s {
        "3" | "31" | "mqttv31" => Ok(ProtocolVersion::V31),
        "4" | "311" | "mqttv311" => Ok(ProtocolVersion::V311),
        _ => Err(anyhow!("invalid protocol version: {}", s)),
    }
}

fn parse_qos(s: &str) -> Result<QoS> {
    match s {
        "0" | "at-most-once" => Ok(QoS::AtMostOnce),
        "1" | "at-least-once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly-once" => Ok(QoS::ExactlyOnce),
        _ => Err(anyhow!("invalid QoS: {}", s)),
    }
}

struct Printer {
    verbose: bool,
    remaining: Option<usize>,
}

impl EventHandler for Printer {
    fn on_connack(&mut self, _session_present: bool, return_code: ConnectReturnCode) {
        if return_code != ConnectReturnCode::Accepted {
            eprintln!("{}", return_code);
            process::exit(1);
        }
    }

    fn on_suback(&mut self, packet_id: PacketId, granted: &[SubAckReturnCode]) {
        for (i, status) in granted.iter().enumerate() {
            if let SubAckReturnCode::Failure = status {
                warn!("subscription {} of request {} was refused", i, packet_id);
            }
        }
    }

    fn on_publish(&mut self, topic: &str, _qos: QoS, _retain: bool, payload: &[u8]) {
        if self.verbose {
            println!("{} {}", topic, String::from_utf8_lossy(payload));
        } else {
            println!("{}", String::from_utf8_lossy(payload));
        }

        if let Some(ref mut remaining) = self.remaining {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                process::exit(0);
            }
        }
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let printer = Printer {
        verbose: opt.verbose,
        remaining: opt.count,
    };
    let mut client = Client::new(opt.id.as_deref(), printer);
    client.set_keep_alive(opt.keep_alive);
    client.set_clean_session(!opt.no_clean_session);
    client.set_version(opt.protocol_version);
    client.set_auth(
        opt.username.as_deref(),
        opt.password.as_deref().map(str::as_bytes),
    );
    if let Some(ref topic) = opt.will_topic {
        client.set_will(
            opt.will_retain,
            opt.will_qos,
            topic,
            opt.will_payload.as_deref().map(str::as_bytes),
        );
    }

    client.connect(&opt.host, opt.port)?;

    let subscriptions: Vec<(&str, QoS)> =
        opt.topic.iter().map(|t| (t.as_str(), opt.qos)).collect();
    client.subscribe(&subscriptions)?;

    client.run()?;

    Ok(())
}
