use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use recorder_core::names;
use shared::domain::{AssignmentId, AssignmentRecord, NewAssignment, NodeRecord, TabId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/recorder.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    ListAssignments,
    ListNodes {
        #[arg(long, conflicts_with = "assignment")]
        tab: Option<i64>,
        #[arg(long)]
        assignment: Option<i64>,
    },
    /// Creates an assignment with no nodes. Omitting the title generates one.
    CreateAssignment {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListAssignments => {
            for assignment in storage.list_assignments().await? {
                print_assignment(&assignment);
            }
        }
        Command::ListNodes { tab, assignment } => {
            let nodes = match (tab, assignment) {
                (Some(tab_id), _) => storage.nodes_for_tab(TabId(tab_id)).await?,
                (None, Some(assignment_id)) => {
                    storage
                        .nodes_for_assignment(AssignmentId(assignment_id))
                        .await?
                }
                (None, None) => bail!("pass --tab or --assignment"),
            };
            for node in nodes {
                print_node(&node);
            }
        }
        Command::CreateAssignment { title, description } => {
            let generated = names::untitled_assignment(Utc::now());
            let assignment = storage
                .create_assignment(NewAssignment {
                    title: title.unwrap_or(generated.title),
                    description: description.unwrap_or(generated.description),
                    created_at: generated.created_at,
                })
                .await?;
            println!("created assignment local_id={}", assignment.local_id);
        }
    }

    Ok(())
}

fn print_assignment(assignment: &AssignmentRecord) {
    println!(
        "{}\t{}\t{}\t{}",
        assignment.local_id,
        assignment.created_at.to_rfc3339(),
        assignment.title,
        assignment.description
    );
}

fn print_node(node: &NodeRecord) {
    println!(
        "{}\tassignment={}\ttab={}\t{}\t{}",
        node.local_id, node.local_assignment_id, node.tab_id, node.title, node.url
    );
}
