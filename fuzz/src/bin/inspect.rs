#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use sparsecat::{decoder::Decoder, format::FormatKind};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                for format in FormatKind::ALL {
                    let _ = Decoder::new(data, format.format()).inspect();
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
