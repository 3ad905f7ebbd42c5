//! jobd demo binary
//!
//! Serves an in-process job server on the configured addresses with one
//! job kind, `echo`. Real deployments build their own [`App`] with a
//! network connector and their job kinds, then call [`cli::run`].

use jobd::connector::{MemoryBroker, MemoryConnector, WorkConnector};
use jobd::{cli, App, BoxError, Config, DaemonContext};

fn echo(payload: &[u8]) -> Result<Vec<u8>, BoxError> {
    Ok(payload.to_vec())
}

fn default_hook(ctx: &mut DaemonContext) -> Result<(), BoxError> {
    ctx.add_job("echo", "echo")?;
    Ok(())
}

fn connector(config: &Config) -> Box<dyn WorkConnector> {
    let broker = MemoryBroker::new();
    for server in &config.servers {
        broker.listen(server.clone());
    }
    Box::new(MemoryConnector::new(broker))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = App::new(connector)
        .register_job("echo", echo)?
        .register_hook("default", default_hook)?;

    cli::run(app)
}
