use anyhow::Result;
use clap::{Parser, Subcommand};
use convo_rag::commands::{
    ask, collect_paths, ingest_files, list_documents, remove_conversation, show_config,
    show_status, write_config,
};
use convo_rag::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "convo-rag")]
#[command(about = "Conversation-scoped document search and question answering")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file, or show the effective configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Index documents into a conversation
    Ingest {
        /// Conversation the documents belong to
        conversation: String,
        /// Files or directories to index
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Ask a question against a conversation's documents
    Query {
        conversation: String,
        question: String,
    },
    /// Delete all documents and vectors of a conversation
    Remove { conversation: String },
    /// List the documents attached to a conversation
    Documents { conversation: String },
    /// Show index statistics and service health
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load_default()?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config)?;
            } else {
                write_config(&config)?;
            }
        }
        Commands::Ingest {
            conversation,
            paths,
        } => {
            let files = collect_paths(&paths)?;
            ingest_files(&config, &conversation, &files)?;
        }
        Commands::Query {
            conversation,
            question,
        } => {
            ask(&config, &conversation, &question)?;
        }
        Commands::Remove { conversation } => {
            remove_conversation(&config, &conversation)?;
        }
        Commands::Documents { conversation } => {
            list_documents(&config, &conversation)?;
        }
        Commands::Status => {
            show_status(&config)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["convo-rag", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Status));
        }
    }

    #[test]
    fn ingest_command_with_paths() {
        let cli = Cli::try_parse_from(["convo-rag", "ingest", "chat-1", "a.md", "notes/"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest {
                conversation,
                paths,
            } = parsed.command
            {
                assert_eq!(conversation, "chat-1");
                assert_eq!(paths, vec![PathBuf::from("a.md"), PathBuf::from("notes/")]);
            }
        }
    }

    #[test]
    fn ingest_requires_a_path() {
        let cli = Cli::try_parse_from(["convo-rag", "ingest", "chat-1"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        }
    }

    #[test]
    fn query_command() {
        let cli = Cli::try_parse_from(["convo-rag", "query", "chat-1", "What changed?"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Query {
                conversation,
                question,
            } = parsed.command
            {
                assert_eq!(conversation, "chat-1");
                assert_eq!(question, "What changed?");
            }
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["convo-rag", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["convo-rag", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["convo-rag", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
