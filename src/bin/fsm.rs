//! Demonstration and test application.\
//! Loads the specified SCXML documents and prompts for events.
//! Usage:
//!    fsm scxmlfile \[-includePaths paths\]

use std::io::{stdout, Write};
use std::{io, process, thread, time};

use ruscxml::common::{get_arguments, init_logging};
use ruscxml::fsm_executor::FsmExecutor;
use ruscxml::scxml_reader::INCLUDE_PATH_ARGUMENT_OPTION;

fn main() {
    init_logging();

    let (named_opt, final_args) = get_arguments(&[&INCLUDE_PATH_ARGUMENT_OPTION]);

    if final_args.is_empty() {
        println!("Missing argument. Please specify one or more scxml files");
        process::exit(1);
    }

    let mut executor = FsmExecutor::new();
    executor.set_include_paths_from_arguments(&named_opt);

    let mut sessions = Vec::new();
    for file in &final_args {
        match executor.execute(file.as_str()) {
            Ok(session) => {
                sessions.push(session);
            }
            Err(err) => {
                eprintln!("Failed to load '{}': {}", file, err);
                process::exit(2);
            }
        }
    }

    let session = sessions.first().unwrap();

    let mut line = String::new();
    let stdin = io::stdin();

    loop {
        // Let the FSM some time to process.
        // Only needed to ensure that the prompt is printed after the normal
        // FSM output.
        thread::sleep(time::Duration::from_millis(200));

        if session.is_finished() {
            println!("\nSM finished!");
            executor.shutdown();
            break;
        }
        print!("\nEnter Event >>");
        let _ = stdout().flush();
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(_s) => {
                let event = line.trim();
                if event.eq_ignore_ascii_case("quit") {
                    for s in &sessions {
                        s.cancel();
                    }
                    executor.shutdown();
                    break;
                } else if event.is_empty() || event.eq_ignore_ascii_case("help") {
                    println!(
                        r#"Usage:
To send events, type the name of the event and press enter.
Remind that events are case sensitive.
Enter 'quit' to cancel all sessions and exit.
To print this information enter 'help' or an empty line.
"#
                    );
                } else {
                    session.send(event, None);
                }
            }
            Err(e) => {
                eprintln!("Error: {}. aborting...", e);
                process::exit(-1);
            }
        }
    }
}
