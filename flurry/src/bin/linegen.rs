use std::io::{self, BufWriter, ErrorKind, Write};

use clap::Parser;
use flurry::config::expand_series_key;
use flurry_line::{Field, now_nanos, write_line};
use tracing::debug;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Line(#[from] flurry_line::Error),
}

#[derive(Parser, Debug)]
#[clap(version, about = "Print synthetic line protocol to stdout", long_about = None)]
struct Opts {
    /// Lines to print, zero for no limit
    #[clap(long, default_value_t = 0)]
    lines: u64,
    /// Series key of every line, `{pid}` is replaced by the process id
    #[clap(long, default_value = "tmp,pid={pid}")]
    series_key: String,
}

fn is_broken_pipe(err: &flurry_line::Error) -> bool {
    match err {
        flurry_line::Error::Io(io) => io.kind() == ErrorKind::BrokenPipe,
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish()
        .init();

    let opts = Opts::parse();
    let key = expand_series_key(&opts.series_key);
    let mut out = BufWriter::new(io::stdout().lock());

    let mut ctr = 0_u64;
    while opts.lines == 0 || ctr < opts.lines {
        let fields = [Field::int("ctr", i64::try_from(ctr).unwrap_or(i64::MAX))];
        if let Err(err) = write_line(&mut out, key.as_bytes(), &fields, now_nanos()) {
            if is_broken_pipe(&err) {
                debug!("Reader went away after {ctr} lines");
                return Ok(());
            }
            return Err(err.into());
        }
        ctr += 1;
    }

    match out.flush() {
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        res => Ok(res?),
    }
}
