//! One-shot commands inside a running server: shell exec and the game console.

use std::net::{Ipv4Addr, SocketAddr};

use berth_types::{ServerEvent, ServerId};

use crate::{error::Result, lifecycle::Orchestrator, rcon};

fn shell(command: &str) -> Vec<String> {
    vec!["/bin/bash".to_string(), "-c".to_string(), command.to_string()]
}

impl Orchestrator {
    /// Runs `command` through `/bin/bash -c` and returns the combined output.
    pub async fn exec(&self, server_id: &ServerId, command: &str) -> Result<String> {
        let entry = self.running_entry(server_id)?;
        let output = self.runtime.exec(&entry.handle, shell(command)).await?;

        self.record_command(server_id, command, &output);
        self.events.publish(&ServerEvent::Log {
            server_id: server_id.clone(),
            message: output.clone(),
        });
        Ok(output)
    }

    /// Sends `command` to the game console over RCON when the server has it configured, otherwise
    /// through the exec channel.
    pub async fn console(&self, server_id: &ServerId, command: &str) -> Result<String> {
        let entry = self.running_entry(server_id)?;
        let rcon = entry.config.as_ref().and_then(|c| c.rcon_endpoint());

        let output = match rcon {
            Some((port, password)) => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                tracing::debug!(server_id = %server_id, %addr, "console command over rcon");
                rcon::execute(addr, password, command, self.config.rcon.timeout()).await?
            }
            None => self.runtime.exec(&entry.handle, shell(command)).await?,
        };

        self.record_command(server_id, command, &output);
        self.events.publish(&ServerEvent::Console {
            server_id: server_id.clone(),
            command: command.to_string(),
            output: output.clone(),
        });
        Ok(output)
    }

    fn record_command(&self, server_id: &ServerId, command: &str, output: &str) {
        self.logs.append(server_id, &format!("> {command}"));
        let output = output.trim_end();
        if !output.is_empty() {
            self.logs.append(server_id, output);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use berth_types::ServerConfig;

    use super::*;
    use crate::{
        config::OrchestratorConfig,
        error::OrchestratorError,
        events::recording::RecordingSink,
        testing::{FakeRuntime, fake_rcon_server},
    };

    async fn setup(config: ServerConfig) -> (Arc<FakeRuntime>, Arc<RecordingSink>, Orchestrator) {
        let runtime = Arc::new(FakeRuntime::new());
        let sink = Arc::new(RecordingSink::default());
        let orch = Orchestrator::new(runtime.clone(), sink.clone(), OrchestratorConfig::default());
        orch.create(ServerId::parse("alpha").unwrap(), config)
            .await
            .unwrap();
        (runtime, sink, orch)
    }

    fn alpha() -> ServerId {
        ServerId::parse("alpha").unwrap()
    }

    #[tokio::test]
    async fn exec_runs_through_bash_and_logs() {
        let (runtime, sink, orch) = setup(ServerConfig::new("Alpha", 8211)).await;
        runtime.set_exec_output("total 0\n");

        let out = orch.exec(&alpha(), "ls -la /palworld").await.unwrap();
        assert_eq!(out, "total 0\n");
        assert_eq!(
            runtime.exec_commands(),
            vec![vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "ls -la /palworld".to_string()
            ]]
        );

        let logs = orch.logs().get_logs(&alpha(), 10);
        assert!(logs[logs.len() - 2].ends_with("] > ls -la /palworld"));
        assert!(logs[logs.len() - 1].ends_with("] total 0"));
        assert!(sink.events().contains(&ServerEvent::Log {
            server_id: alpha(),
            message: "total 0\n".to_string(),
        }));
    }

    #[tokio::test]
    async fn exec_requires_running_server() {
        let (_, _, orch) = setup(ServerConfig::new("Alpha", 8211)).await;
        assert!(matches!(
            orch.exec(&ServerId::parse("ghost").unwrap(), "true").await,
            Err(OrchestratorError::NotFound(_))
        ));
        orch.stop(&alpha()).await.unwrap();
        assert!(matches!(
            orch.exec(&alpha(), "true").await,
            Err(OrchestratorError::NotRunning(_))
        ));
        assert!(matches!(
            orch.console(&alpha(), "Save").await,
            Err(OrchestratorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn console_falls_back_to_exec_without_rcon() {
        let (runtime, sink, orch) = setup(ServerConfig::new("Alpha", 8211)).await;
        runtime.set_exec_output("saved");

        let out = orch.console(&alpha(), "Save").await.unwrap();
        assert_eq!(out, "saved");
        assert_eq!(runtime.exec_commands().len(), 1);
        assert!(sink.topics().contains(&"server:alpha:console".to_string()));
    }

    #[tokio::test]
    async fn console_uses_rcon_when_configured() {
        let addr = fake_rcon_server("secret", true).await;
        let mut config = ServerConfig::new("Alpha", 8211);
        config.admin_password = Some("secret".to_string());
        config.rcon_port = Some(addr.port());
        let (runtime, sink, orch) = setup(config).await;

        let out = orch.console(&alpha(), "ShowPlayers").await.unwrap();
        assert_eq!(out, "echo: ShowPlayers");
        assert!(runtime.exec_commands().is_empty());
        assert!(sink.events().contains(&ServerEvent::Console {
            server_id: alpha(),
            command: "ShowPlayers".to_string(),
            output: "echo: ShowPlayers".to_string(),
        }));
    }

    #[tokio::test]
    async fn console_auth_failure_surfaces() {
        let addr = fake_rcon_server("secret", true).await;
        let mut config = ServerConfig::new("Alpha", 8211);
        config.admin_password = Some("wrong".to_string());
        config.rcon_port = Some(addr.port());
        let (_, _, orch) = setup(config).await;

        let err = orch.console(&alpha(), "ShowPlayers").await.unwrap_err();
        assert_eq!(err.code(), "console_error");
    }
}
