fn main() {
    audio_fetch::run()
}
