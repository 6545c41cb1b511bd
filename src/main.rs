fn main() {
    brats_pipeline::cli::run();
}
