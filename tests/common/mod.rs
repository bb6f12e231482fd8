use assert_cmd::Command;

pub fn duebot_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("duebot").expect("duebot test binary should build")
    }
}
