use std::net::Ipv4Addr;

fn usage_and_exit() -> ! {
    eprintln!(
        "worldd (world-side character daemon)\n\n\
USAGE:\n  worldd [--world-id N]\n\n\
ENV:\n  WORLDD_WORLD_ID             this world's id (high 16 bits of character ids)\n  WORLDD_MQ_SERVER            default 127.0.0.1\n  WORLDD_MQ_PORT              default 5672\n  WORLDD_MQ_SSL               0/1, default 0\n  WORLDD_MQ_SSL_VERIFY        0/1, default 1\n  WORLDD_MQ_SSL_CA_FILE       PEM file with the broker CA\n  WORLDD_MQ_SSL_CLIENT_CERT   PKCS#12 bundle for client auth\n  WORLDD_MQ_SSL_CLIENT_KEY    passphrase for the PKCS#12 bundle\n  WORLDD_MQ_USERNAME          default guest\n  WORLDD_MQ_PASSWORD          default guest\n  WORLDD_MQ_VHOST             default /\n  WORLDD_RESERVATION_TIMEOUT  seconds, default 120\n  WORLDD_DB_SERVER            default 127.0.0.1\n  WORLDD_DB_PORT              default 3306\n  WORLDD_DB_DATABASE          default world\n  WORLDD_DB_USERNAME          default world\n  WORLDD_DB_PASSWORD         \n  WORLDD_DB_PREFIX            optional table name prefix\n  WORLDD_ZONE_IP              zone server advertised to clients\n  WORLDD_ZONE_PORT            default 54230\n  WORLDD_SEARCH_IP            search server advertised to clients\n  WORLDD_SEARCH_PORT          default 54002\n"
    );
    std::process::exit(2);
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| usage_and_exit()),
        Err(_) => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub world_id: u16,

    pub mq_server: String,
    pub mq_port: u16,
    pub mq_ssl: bool,
    pub mq_ssl_verify: bool,
    pub mq_ssl_ca_file: Option<String>,
    pub mq_ssl_client_cert: Option<String>,
    pub mq_ssl_client_key: Option<String>,
    pub mq_username: String,
    pub mq_password: String,
    pub mq_vhost: String,

    pub reservation_timeout: u64,

    pub db_server: String,
    pub db_port: u16,
    pub db_database: String,
    pub db_username: String,
    pub db_password: String,
    pub db_prefix: String,

    pub zone_ip: Ipv4Addr,
    pub zone_port: u16,
    pub search_ip: Ipv4Addr,
    pub search_port: u16,
}

pub fn parse_args() -> Config {
    let mut world_id: u16 = env_parse("WORLDD_WORLD_ID", 0);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--world-id" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                world_id = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    if world_id == 0 {
        eprintln!("worldd: WORLDD_WORLD_ID is required and must be nonzero");
        std::process::exit(2);
    }

    Config {
        world_id,
        mq_server: env_or("WORLDD_MQ_SERVER", "127.0.0.1"),
        mq_port: env_parse("WORLDD_MQ_PORT", 5672),
        mq_ssl: env_flag("WORLDD_MQ_SSL", false),
        mq_ssl_verify: env_flag("WORLDD_MQ_SSL_VERIFY", true),
        mq_ssl_ca_file: std::env::var("WORLDD_MQ_SSL_CA_FILE").ok(),
        mq_ssl_client_cert: std::env::var("WORLDD_MQ_SSL_CLIENT_CERT").ok(),
        mq_ssl_client_key: std::env::var("WORLDD_MQ_SSL_CLIENT_KEY").ok(),
        mq_username: env_or("WORLDD_MQ_USERNAME", "guest"),
        mq_password: env_or("WORLDD_MQ_PASSWORD", "guest"),
        mq_vhost: env_or("WORLDD_MQ_VHOST", "/"),
        reservation_timeout: env_parse("WORLDD_RESERVATION_TIMEOUT", 120),
        db_server: env_or("WORLDD_DB_SERVER", "127.0.0.1"),
        db_port: env_parse("WORLDD_DB_PORT", 3306),
        db_database: env_or("WORLDD_DB_DATABASE", "world"),
        db_username: env_or("WORLDD_DB_USERNAME", "world"),
        db_password: env_or("WORLDD_DB_PASSWORD", ""),
        db_prefix: env_or("WORLDD_DB_PREFIX", ""),
        zone_ip: env_or("WORLDD_ZONE_IP", "127.0.0.1")
            .parse()
            .unwrap_or_else(|_| usage_and_exit()),
        zone_port: env_parse("WORLDD_ZONE_PORT", 54230),
        search_ip: env_or("WORLDD_SEARCH_IP", "127.0.0.1")
            .parse()
            .unwrap_or_else(|_| usage_and_exit()),
        search_port: env_parse("WORLDD_SEARCH_PORT", 54002),
    }
}
