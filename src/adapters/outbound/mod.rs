mod http_probe;
mod tcp_probe;

pub use http_probe::HttpProbe;
pub use tcp_probe::TcpProbe;
