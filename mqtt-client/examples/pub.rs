use std::process;

use anyhow::{anyhow, Result};
use log::info;
use structopt::StructOpt;

use mqtt_client::{Client, EventHandler};
use mqtt_client::codec::{ConnectReturnCode, PacketId, ProtocolVersion, QoS};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pub",
    about = "a simple mqtt client that publishes one message on a topic"
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

    /// Quality of service level for the message.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,

    /// Retain the message on the broker.
    #[structopt(short, long)]
    retain: bool,

    /// The MQTT topic to publish on.
    #[structopt(short, long)]
    topic: String,

    /// The message payload to send.
    #[structopt(short, long)]
    message: String,
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

#[derive(Default)]
struct Confirm;

impl EventHandler for Confirm {
    fn on_connack(&mut self, _session_present: bool, return_code: ConnectReturnCode) {
        if return_code != ConnectReturnCode::Accepted {
            eprintln!("{}", return_code);
            process::exit(1);
        }
    }

    fn on_puback(&mut self, packet_id: PacketId) {
        info!("message {} acknowledged", packet_id);
        process::exit(0);
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let mut client = Client::new(opt.id.as_deref(), Confirm::default());
    client.set_keep_alive(opt.keep_alive);
    client.set_version(opt.protocol_version);
    client.set_auth(
        opt.username.as_deref(),
        opt.password.as_deref().map(str::as_bytes),
    );

    client.connect(&opt.host, opt.port)?;
    client.publish(&opt.topic, opt.qos, opt.retain, opt.message.as_bytes())?;

    if opt.qos == QoS::AtMostOnce {
        client.disconnect()?;
    }

    client.run()?;

    Ok(())
}
