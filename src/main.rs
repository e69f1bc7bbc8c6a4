use cli_batteries::{run, version};
use typerace_server::async_main;

fn main() {
    run(version!(), async_main);
}
