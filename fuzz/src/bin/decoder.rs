#[cfg(not(windows))]
mod fuzz {
    use std::{
        io::{self, Cursor},
        sync::atomic::AtomicBool,
    };

    use honggfuzz::fuzz;
    use sparsecat::{decoder::Decoder, format::FormatKind};

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);

        loop {
            fuzz!(|data: &[u8]| {
                for format in FormatKind::ALL {
                    // Huge declared sizes take too long to materialize.
                    let mut decoder = Decoder::new(data, format.format());
                    if !decoder.file_size().is_ok_and(|s| s <= 16 * 1024 * 1024) {
                        continue;
                    }

                    let _ = decoder.copy_to(io::sink(), &cancel_signal);

                    let mut decoder = Decoder::new(data, format.format());
                    let _ = decoder.write_sparse(Cursor::new(Vec::new()), &cancel_signal);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
