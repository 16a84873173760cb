use clap::Parser;

use rvemu::{ExitReason, GpReg, Machine};

/// Run a statically linked RV64 Linux executable.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Guest executable (statically linked RV64GC ELF)
    elf: String,

    /// Arguments passed through to the guest program
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("rvemu: fatal: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> rvemu::Result<()> {
    let mut machine = Machine::new();
    machine.load_program(&args.elf)?;

    let mut guest_argv = vec![args.elf.clone()];
    guest_argv.extend(args.guest_args.iter().cloned());
    machine.setup(&guest_argv);

    // The dispatcher only ever comes back for an environment call; service
    // it and re-enter. Guest exit happens inside the shim.
    loop {
        let reason = machine.step()?;
        debug_assert_eq!(reason, ExitReason::Ecall);

        let n = machine.gp_reg(GpReg::A7);
        let ret = rvemu::syscall::handle(&mut machine, n)?;
        machine.set_gp_reg(GpReg::A0, ret);
    }
}
