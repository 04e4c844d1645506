//! # ragchat
//!
//! Chat with your documents from the terminal.
//!
//! ```bash
//! ragchat            # index ./data (or load ./index_store) and start chatting
//! ragchat --verbose  # also print timing and token stats after each answer
//! ```
//!
//! Configuration comes from `$RAGCHAT_CONFIG` or `./ragchat.toml`; see
//! [`ragchat::config`]. Exit status is `1` when the corpus directory had to
//! be created, or on any setup error.

use clap::Parser;
use std::process::ExitCode;

use ragchat::acquire::{acquire_index, Acquisition, IndexOrigin};
use ragchat::chat::{run_chat_loop, BANNER};
use ragchat::config::{config_path, load_config};
use ragchat::embedding::create_provider;
use ragchat::generation::create_chat_provider;
use ragchat::progress::ProgressMode;
use ragchat::session::Session;

/// Local RAG chat assistant: answers questions grounded in the files under
/// the corpus directory, streaming replies from a local or remote model.
#[derive(Parser)]
#[command(name = "ragchat", version, about)]
struct Cli {
    /// Print elapsed time and token statistics after every answer
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = load_config(&config_path())?;

    tracing_subscriber::fmt()
        .with_max_level(cfg.logging.tracing_level()?)
        .with_writer(std::io::stderr)
        .init();

    println!("==== ragchat ====");
    println!(
        "Drop files (txt, pdf, md, docx, etc) into the '{}' folder.\n",
        cfg.corpus.dir.display()
    );

    let embedder = create_provider(&cfg.embedding)?;
    let progress = ProgressMode::default_for_tty().reporter();

    let index = match acquire_index(&cfg, embedder.as_ref(), progress.as_ref()).await? {
        Acquisition::CorpusCreated(dir) => {
            println!(
                "Created directory '{}'. Put your files there and re-run.",
                dir.display()
            );
            return Ok(ExitCode::from(1));
        }
        Acquisition::Ready(index, origin) => {
            if origin == IndexOrigin::Loaded {
                println!(
                    "Loaded index of {} files from '{}'.",
                    index.documents().len(),
                    cfg.index.store_dir.display()
                );
            }
            index
        }
    };

    let provider = create_chat_provider(&cfg.generation)?;
    let mut session = Session::open(
        index,
        embedder,
        provider,
        cfg.retrieval.clone(),
        cfg.generation.system_prompt.clone(),
    );

    println!("\n{}\n", BANNER);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    run_chat_loop(&mut session, stdin.lock(), &mut stdout, cli.verbose).await?;

    Ok(ExitCode::SUCCESS)
}
