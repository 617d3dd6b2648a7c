//! benchdb command-line tool
//!
//! Inspects and maintains result stores written by the `benchdb-store`
//! library: quick looks at the data, existence checks, and the operations
//! that need exclusive access (compaction, repair, deduplication, removal).

// CLI binary needs to output to stdout/stderr - this is intentional
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod commands;
mod logging;

use cli::{EXIT_OK, exit_code_for, render_error};
use std::io::{BufWriter, Write};

fn main() {
    let cli = cli::parse();
    if let Err(e) = logging::init_tracing(cli.level, cli.log_format) {
        eprintln!("{e:?}");
    }

    let result = commands::resolve_root(cli.store.as_deref()).and_then(|root| {
        let mut out = BufWriter::new(std::io::stdout().lock());
        commands::execute(&cli.command, &root, cli.json, &mut out)?;
        out.flush()?;
        Ok(())
    });

    let code = match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            let code = exit_code_for(&err);
            render_error(err, cli.json);
            code
        }
    };
    std::process::exit(code);
}
