// src/cli/serve.rs — Run the broker

use std::sync::Arc;

use crate::api::{self, ApiState};
use crate::core::clock::SystemClock;
use crate::core::{Broker, BrokerSettings};
use crate::infra::config::Config;
use crate::infra::paths;
use crate::runner::AnsibleRunner;

pub async fn run_serve(mut config: Config, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    if config.server.token.is_none() {
        tracing::warn!("No server.token configured; anyone who can reach the API can create sessions");
    }

    let settings = BrokerSettings::from_config(&config);
    paths::ensure_dirs(&settings.work_dir).await?;

    let runner = Arc::new(AnsibleRunner::new(&config.runner));
    let broker = Arc::new(Broker::start(settings, runner, Arc::new(SystemClock)));
    let sweeper = broker.clone().run_sweeper(config.session.sweep_interval());

    let state = ApiState {
        broker,
        token: config.server.token.clone(),
    };
    let result = api::start_server(&config.server, state).await;
    sweeper.abort();
    result
}
