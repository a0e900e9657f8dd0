fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { any(target_os = "linux", target_os = "android") },
      apple: { target_vendor = "apple" },
      kqueue: { any(target_vendor = "apple", target_os = "freebsd", target_os = "dragonfly") },
  }
}
