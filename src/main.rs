fn main() {
    order_sheet_lib::run()
}
