mod scenarios;
mod test_ctx;

use lsphook::set_debug_enabled;

fn main() {
    set_debug_enabled(true);
    scenarios::run_all();
    println!("hook_test all scenarios passed");
}
