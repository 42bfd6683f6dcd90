mod scripts;

#[cfg(target_arch = "x86_64")]
mod app;

#[cfg(target_arch = "x86_64")]
fn main() {
    env_logger::init();
    match app::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("deptrace: {err:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn main() {
    eprintln!("deptrace: only x86-64 Linux is supported");
    std::process::exit(1);
}
