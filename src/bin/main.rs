fn main() {
    vigil::main()
}
