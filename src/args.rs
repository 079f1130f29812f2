use std::env;
use std::process;

use getopts::Options;

use synapse_sched::log;

pub struct Args {
    pub config: Option<String>,
    pub level: Option<log::LogLevel>,
    pub peers: usize,
    pub pieces: u32,
}

pub fn args() -> Args {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();
    opts.optflag("h", "help", "Show help message.");
    opts.optflag("d", "debug", "Enable debug logging.");
    opts.optopt("c", "config", "Use config file.", "FILE");
    opts.optopt("p", "peers", "Peers in the simulated swarm (default 8).", "PEERS");
    opts.optopt("n", "pieces", "Pieces in the simulated torrent (default 64).", "PIECES");
    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            println!("Failed to parse options: {}", f);
            usage(1, opts);
        }
    };

    if matches.opt_present("h") {
        usage(0, opts);
    }

    let mut args = Args {
        config: None,
        level: None,
        peers: 8,
        pieces: 64,
    };

    if matches.opt_present("d") {
        args.level = Some(log::LogLevel::Debug);
    }

    if let Some(cfg) = matches.opt_str("c") {
        args.config = Some(cfg);
    }

    if let Some(p) = matches.opt_str("p") {
        match p.parse() {
            Ok(n) if n > 0 => args.peers = n,
            _ => {
                println!("Invalid peer count: {}", p);
                usage(1, opts);
            }
        }
    }

    if let Some(p) = matches.opt_str("n") {
        match p.parse() {
            Ok(n) if n > 0 => args.pieces = n,
            _ => {
                println!("Invalid piece count: {}", p);
                usage(1, opts);
            }
        }
    }

    args
}

fn usage(code: i32, opts: Options) -> ! {
    let brief = "Usage: synsched [options]";
    print!("{}", opts.usage(brief));
    process::exit(code);
}
