use assert_cmd::Command;
use serial_test::serial;
use std::path::PathBuf;

macro_rules! create_test {
    ( $op:ident, $num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            #[allow(non_snake_case)]
            fn [<$op _ $num_pes pes_sweep>]() {
                let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
                d.push("xferbench_run.sh");
                let result = Command::new(d.into_os_string())
                    .arg(format!("-N={}", $num_pes))
                    .arg(env!("CARGO_BIN_EXE_xferbench"))
                    .env("XFERBENCH_JOB_ID", format!("{}{}", std::process::id(), $num_pes))
                    .env("XFERBENCH_OP_TYPE", stringify!($op))
                    .env("XFERBENCH_TOTAL_BUFFER_SIZE", "1048576")
                    .env("XFERBENCH_START_BLOCK_SIZE", "4096")
                    .env("XFERBENCH_MAX_BLOCK_SIZE", "65536")
                    .env("XFERBENCH_NUM_ITER", "8")
                    .env("XFERBENCH_WARMUP_ITER", "2")
                    .env("XFERBENCH_BARRIER_TIMEOUT", "60.0")
                    .assert();
                println!("{:?}", result);
                let result = result.success();
                let stdout = String::from_utf8_lossy(&result.get_output().stdout).to_string();
                assert!(stdout.contains(&format!("over {} ranks", $num_pes)), "{}", stdout);
                // only the initiator prints, one row per block size
                for block_size in [4096, 8192, 16384, 32768, 65536] {
                    let rows = stdout
                        .lines()
                        .filter(|l| l.starts_with(&format!("{} ", block_size)))
                        .count();
                    assert_eq!(rows, 1, "{}", stdout);
                }
            }
        }
    };
}

macro_rules! create_tests {
    ( ($($op:ident),*), $num_pes:expr) => {
        $(create_test!($op, $num_pes);)*
    };
}

create_tests!((write, read), 2);
