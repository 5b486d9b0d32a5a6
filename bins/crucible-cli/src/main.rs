mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crucible-cli")]
#[command(about = "Crucible CLI - manage sandbox language profiles and images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a language profile to the catalog
    AddLang {
        /// Language id (e.g. python, javascript, c)
        #[arg(short, long)]
        name: String,

        /// Source file extension (e.g. py, js, c)
        #[arg(short, long)]
        ext: String,

        /// Runtime version the image pins (e.g. 3.12, 20, 13)
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Base Docker image for the generated Dockerfile
        #[arg(short, long)]
        base_image: Option<String>,

        /// Run command executed inside the workspace
        #[arg(short, long)]
        run: Option<String>,

        /// Compile command for compiled languages
        #[arg(short, long)]
        compile: Option<String>,

        /// Memory ceiling in MB
        #[arg(short, long, default_value = "128")]
        memory: u64,

        /// CPU ceiling
        #[arg(long, default_value = "1.0")]
        cpus: f64,

        /// Wall-clock budget in milliseconds (compile included)
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Build the Docker image after adding the profile
        #[arg(long, default_value = "true")]
        build_docker: bool,
    },

    /// Build the pinned Docker image for a language
    BuildImage {
        /// Language id
        #[arg(short, long)]
        name: String,

        /// Skip the build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Scaffold a new deployment (config, docker and template directories)
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::AddLang {
            name,
            ext,
            version,
            base_image,
            run,
            compile,
            memory,
            cpus,
            timeout_ms,
            build_docker,
        } => {
            commands::add_language(
                &name,
                &ext,
                &version,
                base_image.as_deref(),
                run.as_deref(),
                compile.as_deref(),
                memory,
                cpus,
                timeout_ms,
                build_docker,
            )
            .await?;
        }
        Commands::BuildImage { name, no_cache } => {
            commands::build_docker_image(&name, no_cache).await?;
        }
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
    }

    Ok(())
}
