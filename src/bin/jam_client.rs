use clap::Parser;
use log::{error, info, warn};
use netmix_rust::{
    common::{
        box_error::BoxError,
        buffers_config::{DEFAULT_SERVER_PORT, SAMPLE_BUFFER_SIZE, SAMPLE_RATE},
        config::Config,
        encryption::cipher_from_key,
        get_micro_time,
        jam_packet::ChannelSetup,
        stream_time_stat::MicroTimer,
    },
    sound::{
        client::{CLIENT_BASE_PORT, CLIENT_PORT_SPREAD},
        jam_engine::JamEngine,
        jam_socket::JamSocket,
        SoundCallback,
    },
};
use std::{f32::consts::PI, thread::sleep, time::Duration};
use thread_priority::{ThreadBuilder, ThreadPriority};

const FRAME_MICROS: u128 = SAMPLE_BUFFER_SIZE as u128 * 1_000_000 / SAMPLE_RATE as u128;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Jam client that plays a test tone into the session
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// server host name or address
    #[arg(short, long)]
    server: Option<String>,

    /// server port
    #[arg(short, long)]
    port: Option<u16>,

    /// key file or base64 key
    #[arg(short, long)]
    key: Option<String>,

    /// settings file
    #[arg(short, long, default_value = "client_settings.json")]
    config: String,

    /// do not send or ask for FEC data
    #[arg(long)]
    no_fec: bool,

    /// frequency of the test tone in Hz
    #[arg(short, long, default_value_t = 440.0)]
    tone: f32,

    /// ask another client to change a volume, as client_id:channel:percent
    #[arg(long)]
    remote_volume: Option<String>,
}

fn client_defaults() -> json::JsonValue {
    json::object! {
        "server": "127.0.0.1",
        "port": DEFAULT_SERVER_PORT,
        "key": "",
        "fec": true,
    }
}

fn parse_remote_volume(arg: &str) -> Result<(u32, u16, f32), BoxError> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 3 {
        simple_error::bail!("remote volume should look like client_id:channel:percent");
    }
    Ok((parts[0].parse()?, parts[1].parse()?, parts[2].parse()?))
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(&args.config, client_defaults())?;
    if let Some(server) = args.server {
        config.set_value("server", server)?;
    }
    if let Some(port) = args.port {
        config.set_value("port", port)?;
    }
    if let Some(key) = args.key {
        config.set_value("key", key)?;
    }
    if args.no_fec {
        config.set_value("fec", false)?;
    }
    let server = config.get_str_value("server", None)?;
    let port = config.get_u32_value("port", None)?;
    if port > u16::MAX as u32 {
        simple_error::bail!("port {} out of range", port);
    }
    let cipher = cipher_from_key(config.get_opt_str_value("key").as_deref())?;

    let mut sock = JamSocket::build_random(CLIENT_BASE_PORT, CLIENT_PORT_SPREAD)?;
    sock.connect(&server, port as u16)?;
    info!("jam_client {}", sock);

    let mut engine = JamEngine::connect(sock, cipher, ChannelSetup::stereo())?;
    engine.client_mut().set_send_fec_data(config.get_bool_value("fec", None)?)?;
    if let Some(arg) = args.remote_volume {
        let (client_id, channel, percent) = parse_remote_volume(&arg)?;
        let seq = engine.client_mut().send_remote_volume(client_id, channel, percent)?;
        info!("asked client {} for channel {} at {}% (#{})", client_id, channel, percent, seq);
    }
    let state = engine.client().receive_state();
    let playout = engine.playout();

    let tone = args.tone;
    let _audio_handle = ThreadBuilder::default()
        .name("audio".to_string())
        .priority(ThreadPriority::Max)
        .spawn(move |result| {
            if let Err(e) = result {
                warn!("audio thread running without raised priority: {:?}", e);
            }
            let step = 2.0 * PI * tone / SAMPLE_RATE as f32;
            let mut phase = 0.0f32;
            let mut in_a = [0.0f32; SAMPLE_BUFFER_SIZE];
            let in_b = [0.0f32; SAMPLE_BUFFER_SIZE];
            let mut out_a = [0.0f32; SAMPLE_BUFFER_SIZE];
            let mut out_b = [0.0f32; SAMPLE_BUFFER_SIZE];
            let mut timer = MicroTimer::new(get_micro_time(), FRAME_MICROS);
            loop {
                if !timer.expired(get_micro_time()) {
                    sleep(Duration::from_micros(200));
                    continue;
                }
                timer.advance();
                for sample in in_a.iter_mut() {
                    *sample = 0.25 * phase.sin();
                    phase = (phase + step) % (2.0 * PI);
                }
                if let Err(e) = engine.process(&in_a, &in_b, &mut out_a, &mut out_b) {
                    error!("audio callback failed: {}", e);
                    return;
                }
            }
        })?;

    loop {
        sleep(STATS_INTERVAL);
        info!(
            "receiving: {}, rtt: {:.1} ms, playout {}",
            state.is_receiving(),
            state.current_rtt(),
            playout.quality_statement()
        );
        if let Some(clients) = state.client_info() {
            for client in clients.iter() {
                info!("{}: {}", client.address, client.quality);
            }
        }
        if let Some(session) = state.session_setup() {
            info!("session: {}", session);
        }
    }
}
