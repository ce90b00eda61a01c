use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn register_student(&self, name: &str, roll_number: &str, image: &[u8]) -> zbus::Result<String>;
    fn mark_attendance(&self, teacher_id: &str, subject: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_students(&self) -> zbus::Result<String>;
    fn update_student(&self, id: &str, name: &str, roll_number: &str) -> zbus::Result<String>;
    fn remove_student(&self, id: &str) -> zbus::Result<bool>;
    fn session_report(&self, session_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition classroom attendance")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a portrait containing exactly one face
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        roll_number: String,
        /// Portrait image (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Mark attendance from a classroom photo
    Mark {
        /// Teacher taking attendance
        #[arg(short, long)]
        teacher: String,
        #[arg(short, long)]
        subject: String,
        /// Classroom photo
        image: PathBuf,
    },
    /// List registered students
    Students,
    /// Change a student's name or roll number
    Update {
        id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        roll_number: Option<String>,
    },
    /// Remove a student and their registered faces
    Remove { id: String },
    /// Show the presence records and audit trail of a session
    Report { session_id: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Register { name, roll_number, image } => {
            let bytes = read_image(&image).await?;
            let id = proxy.register_student(&name, &roll_number, &bytes).await?;
            println!("Registered {name} ({roll_number}) as {id}");
        }
        Commands::Mark { teacher, subject, image } => {
            let bytes = read_image(&image).await?;
            print_json(&proxy.mark_attendance(&teacher, &subject, &bytes).await?)?;
        }
        Commands::Students => print_json(&proxy.list_students().await?)?,
        Commands::Update { id, name, roll_number } => {
            if name.is_none() && roll_number.is_none() {
                anyhow::bail!("nothing to update: pass --name and/or --roll-number");
            }
            let updated = proxy
                .update_student(&id, name.as_deref().unwrap_or(""), roll_number.as_deref().unwrap_or(""))
                .await?;
            print_json(&updated)?;
        }
        Commands::Remove { id } => {
            proxy.remove_student(&id).await?;
            println!("Removed student {id}");
        }
        Commands::Report { session_id } => print_json(&proxy.session_report(&session_id).await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tracing::debug!(path = %path.display(), "reading image");
    tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
