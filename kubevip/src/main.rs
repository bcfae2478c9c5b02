fn main() {
    kubevip_cmd::run()
}
