use anyhow::Result;

fn main() -> Result<()> {
    fwdproxy::run()
}
