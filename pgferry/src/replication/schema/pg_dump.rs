//! Wrapper around pg_dump.

use std::path::PathBuf;
use std::str::from_utf8;

use tokio::process::Command;
use tokio_postgres::config::Host;

use super::super::Error;

#[derive(Debug, Clone)]
pub struct PgDump {
    path: PathBuf,
    config: tokio_postgres::Config,
}

impl PgDump {
    pub fn new(path: &PathBuf, config: &tokio_postgres::Config) -> Self {
        Self {
            path: path.clone(),
            config: config.clone(),
        }
    }

    /// Dump the source schema as SQL text.
    pub async fn dump(&self) -> Result<String, Error> {
        let mut command = Command::new(&self.path);
        command
            .arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges");

        match self.config.get_hosts().first() {
            Some(Host::Tcp(host)) => {
                command.arg("-h").arg(host);
            }
            #[cfg(unix)]
            Some(Host::Unix(path)) => {
                command.arg("-h").arg(path);
            }
            None => (),
        }

        if let Some(port) = self.config.get_ports().first() {
            command.arg("-p").arg(port.to_string());
        }

        if let Some(user) = self.config.get_user() {
            command.arg("-U").arg(user);
        }

        if let Some(password) = self.config.get_password() {
            command.env("PGPASSWORD", from_utf8(password).unwrap_or_default());
        }

        if let Some(database) = self.config.get_dbname() {
            command.arg("-d").arg(database);
        }

        let output = command.output().await?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(Error::PgDump(err.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
