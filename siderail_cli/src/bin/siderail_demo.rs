use std::io::Read;

use siderail_cli::demo;
use siderail_core::instr;

siderail_core::auto_init!();

fn main() {
    let extract = std::env::var_os(demo::EXTRACT_ENV_VAR).is_some();
    let input_path = std::env::args_os().nth(1);
    let mut data = Vec::new();

    while instr::persistent_loop(1000) {
        data.clear();
        let read = match &input_path {
            Some(path) => std::fs::File::open(path).and_then(|mut f| f.read_to_end(&mut data)),
            None => std::io::stdin().lock().read_to_end(&mut data),
        };
        if let Err(e) = read {
            eprintln!("siderail-demo: failed to read input: {e}");
            std::process::exit(1);
        }

        if extract {
            demo::check_sites(&data);
        } else {
            demo::exercise(&data);
        }
    }
}
