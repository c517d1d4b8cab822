fn main() {
    // ESP-IDF builds need the sysenv exported by embuild; host builds
    // (tests, fuzzing) compile without it.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
