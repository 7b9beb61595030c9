use clap::Parser;
use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use sleet::{
    Command, PASSWORD, Session, USER, prompt, protocol::ColumnDescriptor, read_script,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connection string, e.g. sleet:udp://127.0.0.1:7414
    url: String,

    #[arg(long, default_value = USER)]
    user: String,

    #[arg(long, default_value = PASSWORD)]
    password: String,

    /// Run the statements of a script file instead of prompting
    #[arg(long)]
    file: Option<PathBuf>,

    /// Fixed wait bound in milliseconds, replacing the adaptive timeout
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut session = Session::connect(&cli.url, &cli.user, &cli.password)?;
    if let Some(ms) = cli.timeout {
        session.set_query_timeout(Some(Duration::from_millis(ms)));
    }

    let handle = session.shutdown_handle();
    ctrlc::set_handler(move || {
        if let Err(e) = handle.shutdown() {
            eprintln!("failed to stop session: {e}");
        }
    })?;

    let mut stdout = io::stdout().lock();
    match &cli.file {
        Some(path) => {
            for statement in read_script(path)? {
                writeln!(stdout, "> {statement}")?;
                run(&session, &statement, &mut stdout)?;
            }
        }
        None => repl(&session, &mut stdout)?,
    }

    session.close()?;
    Ok(())
}

fn repl(session: &Session, stdout: &mut impl Write) -> Result<(), Box<dyn Error>> {
    let mut columns = Vec::new();

    while !session.is_closed() {
        let cmd = match prompt(io::stdin().lock(), &mut *stdout) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Timeout(timeout) => session.set_query_timeout(timeout),
            Command::Columns => describe(&columns, stdout)?,
            Command::Statement(s) if s.is_empty() => {}
            Command::Statement(s) => match run(session, &s, stdout) {
                Ok(described) => columns = described,
                Err(e) => eprintln!("query error: {e}"),
            },
        }
    }

    Ok(())
}

/// Runs one statement and prints its rows.
fn run(
    session: &Session,
    sql: &str,
    out: &mut impl Write,
) -> Result<Vec<ColumnDescriptor>, Box<dyn Error>> {
    let mut cursor = session.query(sql)?;
    let columns = cursor.metadata().to_vec();

    let header: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    writeln!(out, "{}", header.join(" | "))?;

    let mut count = 0;
    while let Some(row) = cursor.next()? {
        writeln!(out, "{row}")?;
        count += 1;
    }
    writeln!(out, "({count} rows)")?;
    Ok(columns)
}

fn describe(columns: &[ColumnDescriptor], out: &mut impl Write) -> io::Result<()> {
    if columns.is_empty() {
        return writeln!(out, "no result yet");
    }
    for (i, c) in columns.iter().enumerate() {
        writeln!(
            out,
            "{:>3} {} {:?}{} precision={} scale={} width={}",
            i + 1,
            c.name,
            c.sql_type,
            if c.nullable { "" } else { " NOT NULL" },
            c.precision,
            c.scale,
            c.display_size
        )?;
    }
    Ok(())
}
