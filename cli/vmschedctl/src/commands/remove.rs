//! Remove command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// Remove a domain from the host.
#[derive(Debug, Args)]
pub struct RemoveCommand {
    /// Domain name or uuid.
    domain: String,
}

#[derive(Debug)]
enum RemoveQuery<'a> {
    Uuid(&'a str),
    Name(&'a str),
}

impl<'a> RemoveQuery<'a> {
    /// Anything that parses as a uuid is treated as one.
    fn from_target(target: &'a str) -> Self {
        if Uuid::parse_str(target).is_ok() {
            Self::Uuid(target)
        } else {
            Self::Name(target)
        }
    }

    fn pairs(&self) -> [(&'static str, &'a str); 1] {
        match self {
            Self::Uuid(uuid) => [("uuid", uuid)],
            Self::Name(name) => [("name", name)],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoveResponse {
    uuid: String,
}

impl RemoveCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let query = RemoveQuery::from_target(&self.domain);

        let response: RemoveResponse = client.post_query("/remove", &query.pairs()).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&response),
            OutputFormat::Table => print_success(&format!("Removed {}", response.uuid)),
        }
        Ok(())
    }
}
