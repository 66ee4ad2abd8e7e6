use std::net::IpAddr;

fn usage_and_exit() -> ! {
    eprintln!(
        "logingate (login front-end)\n\n\
USAGE:\n  logingate [--login-ip ADDR] [--auth-port N] [--data-port N] [--view-port N]\n\n\
ENV:\n  LOGINGATE_DB_SERVER            default 127.0.0.1\n  LOGINGATE_DB_PORT              default 3306\n  LOGINGATE_DB_DATABASE          default logingate\n  LOGINGATE_DB_USERNAME          default logingate\n  LOGINGATE_DB_PASSWORD         \n  LOGINGATE_DB_PREFIX            optional table name prefix\n  LOGINGATE_LOGIN_IP             default 0.0.0.0\n  LOGINGATE_AUTH_PORT            default 54231\n  LOGINGATE_DATA_PORT            default 54230\n  LOGINGATE_VIEW_PORT            default 54001\n  LOGINGATE_PASSWORD_HASH_SECRET process-wide pepper mixed into password hashes\n  LOGINGATE_NEW_ACCOUNT_CONTENT_IDS  default 3\n  LOGINGATE_MAX_LOGIN_ATTEMPTS   default 3\n  LOGINGATE_MAX_CLIENT_CONNECTIONS   default 10 (per source IP)\n  LOGINGATE_SESSION_TIMEOUT      default 30 (seconds)\n  LOGINGATE_EXPECTED_CLIENT_VERSION  e.g. 30200101_0\n  LOGINGATE_VERSION_LOCK         0 = off, 1 = exact, 2 = minimum\n"
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

#[derive(Clone, Debug)]
pub struct Config {
    pub db_server: String,
    pub db_port: u16,
    pub db_database: String,
    pub db_username: String,
    pub db_password: String,
    pub db_prefix: String,

    pub login_ip: IpAddr,
    pub auth_port: u16,
    pub data_port: u16,
    pub view_port: u16,

    pub password_hash_secret: String,
    pub new_account_content_ids: u8,
    pub max_login_attempts: u32,
    pub max_client_connections: u32,
    pub session_timeout: u64,
    pub expected_client_version: String,
    pub version_lock: u8,
}

pub fn parse_args() -> Config {
    let mut login_ip: IpAddr = env_or("LOGINGATE_LOGIN_IP", "0.0.0.0")
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut auth_port: u16 = env_parse("LOGINGATE_AUTH_PORT", 54231);
    let mut data_port: u16 = env_parse("LOGINGATE_DATA_PORT", 54230);
    let mut view_port: u16 = env_parse("LOGINGATE_VIEW_PORT", 54001);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--login-ip" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                login_ip = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--auth-port" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                auth_port = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--data-port" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                data_port = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--view-port" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                view_port = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    let version_lock: u8 = env_parse("LOGINGATE_VERSION_LOCK", 0);
    if version_lock > 2 {
        usage_and_exit();
    }

    Config {
        db_server: env_or("LOGINGATE_DB_SERVER", "127.0.0.1"),
        db_port: env_parse("LOGINGATE_DB_PORT", 3306),
        db_database: env_or("LOGINGATE_DB_DATABASE", "logingate"),
        db_username: env_or("LOGINGATE_DB_USERNAME", "logingate"),
        db_password: env_or("LOGINGATE_DB_PASSWORD", ""),
        db_prefix: env_or("LOGINGATE_DB_PREFIX", ""),
        login_ip,
        auth_port,
        data_port,
        view_port,
        password_hash_secret: env_or("LOGINGATE_PASSWORD_HASH_SECRET", ""),
        new_account_content_ids: env_parse("LOGINGATE_NEW_ACCOUNT_CONTENT_IDS", 3),
        max_login_attempts: env_parse("LOGINGATE_MAX_LOGIN_ATTEMPTS", 3),
        max_client_connections: env_parse("LOGINGATE_MAX_CLIENT_CONNECTIONS", 10),
        session_timeout: env_parse("LOGINGATE_SESSION_TIMEOUT", 30),
        expected_client_version: env_or("LOGINGATE_EXPECTED_CLIENT_VERSION", ""),
        version_lock,
    }
}
