use super::*;

mod index;
mod watch;

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    #[command(about = "Tail the full node and reconcile blocks with observed work")]
    Index(index::Index),
    #[command(about = "Watch Stratum endpoints for new work")]
    Watch(watch::Watch),
}

impl Subcommand {
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result {
        match self {
            Self::Index(index) => index.run(cancel).await,
            Self::Watch(watch) => watch.run(cancel).await,
        }
    }
}
