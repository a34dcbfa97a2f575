use mqttengine::{
    AsyncClient, DisconnectReasonCode, Filter, Message, QoS, SessionConfig, Transport,
};
use std::env;
use std::error::Error;
use std::fs;
use std::time::Duration;

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn flag(key: &str, default: bool) -> Result<bool, Box<dyn Error>> {
    match var(key) {
        Some(v) => Ok(v.parse()?),
        None => Ok(default),
    }
}

/// Builds the session from `MQTT_*` variables, `.env` included
fn config() -> Result<SessionConfig, Box<dyn Error>> {
    let host = var("MQTT_HOST_NAME").ok_or("MQTT_HOST_NAME is not set")?;
    let port = match var("MQTT_TCP_PORT") {
        Some(port) => port.parse()?,
        None => 8883,
    };

    let client_id = var("MQTT_CLIENT_ID").unwrap_or_else(|| "getting_started".to_owned());
    let mut config = SessionConfig::new(client_id, host, port);

    let keep_alive = match var("MQTT_KEEP_ALIVE_IN_SECONDS") {
        Some(secs) => secs.parse()?,
        None => 30,
    };

    config
        .set_keep_alive(Duration::from_secs(keep_alive))
        .set_clean_start(flag("MQTT_CLEAN_SESSION", true)?);

    if let Some(username) = var("MQTT_USERNAME") {
        config.set_username(username);
    }

    if let Some(password) = var("MQTT_PASSWORD") {
        config.set_password(password);
    }

    if flag("MQTT_USE_TLS", true)? {
        if var("MQTT_KEY_FILE_PASSWORD").is_some() {
            return Err("encrypted keys need a PKCS#12 identity with the use-native-tls feature".into());
        }

        let ca = var("MQTT_CA_FILE").map(fs::read).transpose()?;
        let client_auth = match (var("MQTT_CERT_FILE"), var("MQTT_KEY_FILE")) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };

        config.set_transport(Transport::tls(ca, client_auth, None));
    }

    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    pretty_env_logger::init();

    let config = config()?;
    let (client, eventloop) = AsyncClient::new(10);
    tokio::spawn(eventloop.run());

    let connack = client.connect(config).await?;
    println!("Connected. Session present = {}", connack.session_present);

    let filters = vec![Filter::new("sample/#", QoS::AtLeastOnce)];
    let suback = client
        .subscribe(filters, |message: &Message| {
            println!(
                "Received = {}: {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            );
        })
        .await?;
    println!("Subscribed = {:?}", suback.return_codes);

    let result = client
        .publish("sample/topic1", QoS::AtLeastOnce, false, "hello world!")
        .await?;
    println!("Published = {:?}", result);

    tokio::signal::ctrl_c().await?;
    client
        .disconnect(DisconnectReasonCode::NormalDisconnection)
        .await?;
    println!("Disconnected");
    Ok(())
}
