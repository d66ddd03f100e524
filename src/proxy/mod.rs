pub mod cipher;
pub mod direct;
pub mod dispatcher;
pub mod http;
pub mod http_connect;
pub mod listener;
pub mod mitm;
pub mod outbound;
pub mod probe;
pub mod proxy_group;
pub mod relay;
pub mod runtime;
pub mod snapshot;
pub mod socks5;
pub mod socks5_client;
pub mod socks5_common;
pub mod target;
pub mod tunnel;
