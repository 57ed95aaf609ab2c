fn main() -> std::process::ExitCode {
  vidsync_lib::run()
}
