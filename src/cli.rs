//! Thin command-line collaborator (spec §1: "external collaborators... command-line parsing
//! and argument dispatch"). Parses raw flags with `clap` and hands the protocol engine a plain
//! [`Config`] — the engine never sees a `clap` type.

use clap::Parser;

use crate::acl::AclRule;
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "udptunnel", about = "Lightweight TCP-over-UDP tunnel")]
pub struct RawArgs {
    /// Run as a server, binding the UDP socket at [host:]port.
    #[arg(short = 's', value_name = "[HOST:]PORT")]
    pub server: Option<String>,

    /// Server-only: one ACL rule, "src_ip,dst_ip,dst_port,{allow|deny}".
    #[arg(short = 'a', value_name = "RULE")]
    pub acl: Option<String>,

    /// Run as a client, accepting local TCP connections at [host:]port.
    #[arg(short = 'c', value_name = "[HOST:]PORT")]
    pub client: Option<String>,

    /// Client-only: the UDP tunnel peer to send to.
    #[arg(short = 't', value_name = "HOST:PORT")]
    pub tunnel: Option<String>,

    /// Client-only: the destination the server should connect new channels to.
    #[arg(short = 'r', value_name = "HOST:PORT")]
    pub remote: Option<String>,

    /// Log verbosity, 0 (warnings only) to 3 (trace).
    #[arg(short = 'v', default_value_t = 0)]
    pub verbosity: u8,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub acl: Option<AclRule>,
    pub verbosity: u8,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub listen: String,
    pub tunnel_peer: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub verbosity: u8,
}

#[derive(Debug, Clone)]
pub enum Config {
    Server(ServerConfig),
    Client(ClientConfig),
}

impl RawArgs {
    /// Validates the raw flags into a runnable [`Config`]. `clap` already enforces the shape of
    /// each individual flag; this only enforces the cross-flag rules spec §6 implies (a run is
    /// either a server or a client, never both, and a client needs all three of `-c -t -r`).
    pub fn into_config(self) -> Result<Config, CliError> {
        if self.verbosity > 3 {
            return Err(CliError::BadVerbosity(self.verbosity));
        }

        let acl = self.acl.as_deref().map(AclRule::parse).transpose()?;

        match (self.server, self.client) {
            (Some(listen), None) => Ok(Config::Server(ServerConfig {
                listen,
                acl,
                verbosity: self.verbosity,
            })),
            (None, Some(listen)) => {
                let (Some(tunnel_peer), Some(remote)) = (self.tunnel, self.remote) else {
                    return Err(CliError::MissingClientTarget);
                };
                let (remote_host, remote_port) = remote
                    .rsplit_once(':')
                    .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host.to_string(), port)))
                    .ok_or_else(|| CliError::BadRemoteTarget(remote.clone()))?;

                Ok(Config::Client(ClientConfig {
                    listen,
                    tunnel_peer,
                    remote_host,
                    remote_port,
                    verbosity: self.verbosity,
                }))
            }
            (None, None) => Err(CliError::MissingMode),
            (Some(_), Some(_)) => Err(CliError::ConflictingMode),
        }
    }
}
