use std::io::Write;

use garnet_tftp::config::Config;
use garnet_tftp::{SocketFamily, TftpError};

#[test]
fn test_default_config_is_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.socket_family().unwrap(), SocketFamily::DualStack);
    assert_eq!(config.retransmit, 10);
    assert!(!config.single_port);
}

#[test]
fn test_family_strings_map_to_socket_families() {
    let mut config = Config::default();

    config.family = "udp4".to_string();
    assert_eq!(config.socket_family().unwrap(), SocketFamily::V4);

    config.family = "udp6".to_string();
    assert_eq!(config.socket_family().unwrap(), SocketFamily::V6);
}

#[test]
fn test_invalid_family_rejected() {
    let mut config = Config::default();
    config.family = "tcp".to_string();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, TftpError::InvalidNetwork));
}

#[test]
fn test_negative_retransmit_rejected() {
    let mut config = Config::default();
    config.retransmit = -3;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, TftpError::InvalidRetransmit));
}

#[test]
fn test_from_file_applies_partial_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "bind = \"127.0.0.1:6969\"").unwrap();
    writeln!(file, "single_port = true").unwrap();
    file.flush().unwrap();

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.bind, "127.0.0.1:6969");
    assert!(config.single_port);
    // Unset fields keep their defaults.
    assert_eq!(config.retransmit, 10);
    assert_eq!(config.family, "udp");
}

#[test]
fn test_from_file_rejects_invalid_family() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "family = \"tcp\"").unwrap();
    file.flush().unwrap();

    assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
}
