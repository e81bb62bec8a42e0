// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use pyboot::logging::{emit_error_message, root_logger};

fn main() {
    let log = root_logger();
    let argv: Vec<std::ffi::OsString> = std::env::args_os().collect();

    let exit_code = match pyboot::run(log, argv) {
        Ok(code) => code,
        Err(err) => {
            emit_error_message(&err.to_string());
            -1
        }
    };

    std::process::exit(exit_code);
}
