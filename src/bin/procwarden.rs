fn main() -> anyhow::Result<()> {
    procwarden::pw::main()
}
